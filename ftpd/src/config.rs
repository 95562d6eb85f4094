use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 21;

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub port: u16,
    /// Directory tree exposed as the FTP root.
    pub root: String,
    pub max_sessions: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Auth {
    pub user: String,
    pub pass: String,
    /// Accept the conventional anonymous logins regardless of password.
    pub allow_anonymous: bool,
}

#[derive(Serialize, Deserialize)]
pub struct FtpdConfig {
    pub server: Server,
    pub auth: Auth,
}

impl Default for FtpdConfig {
    fn default() -> FtpdConfig {
        FtpdConfig {
            server: Server {
                port: DEFAULT_PORT,
                root: "/".to_string(),
                max_sessions: 64,
            },
            auth: Auth {
                user: "admin".to_string(),
                pass: "admin".to_string(),
                allow_anonymous: false,
            },
        }
    }
}

impl FtpdConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> FtpdConfig {
        serdeconv::from_toml_file(path).expect("Error loading ftpd configuration file")
    }
}
