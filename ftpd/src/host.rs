use ferrite::Lifecycle;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle flag raised by SIGINT/SIGTERM. The event loop polls it every
/// tick, so shutdown is cooperative rather than abrupt.
pub struct SignalHost {
    stop: Arc<AtomicBool>,
}

impl SignalHost {
    pub fn install() -> io::Result<Arc<SignalHost>> {
        let stop = Arc::new(AtomicBool::new(false));

        flag::register(SIGINT, stop.clone())?;
        flag::register(SIGTERM, stop.clone())?;

        Ok(Arc::new(SignalHost { stop }))
    }
}

impl Lifecycle for SignalHost {
    fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    fn request_exit(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
