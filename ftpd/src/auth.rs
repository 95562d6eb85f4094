use crate::config;
use ferrite::Authenticator;

/// Credential check against the single configured account, with optional
/// anonymous access.
pub struct StaticAuthenticator {
    user: String,
    pass: String,
    allow_anonymous: bool,
}

impl StaticAuthenticator {
    pub fn new(config: &config::Auth) -> StaticAuthenticator {
        StaticAuthenticator {
            user: config.user.clone(),
            pass: config.pass.clone(),
            allow_anonymous: config.allow_anonymous,
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, user: &str, pass: &str) -> bool {
        if self.allow_anonymous && (user == "anonymous" || user == "ftp") {
            return true;
        }

        user == self.user && pass == self.pass
    }
}
