//! Listens for the server shutdown signal.
//!
//! Shutdown is signalled with a `broadcast::Receiver`. Only a single value is
//! ever sent, or the sender is dropped; either way the session stops.

use tokio::sync::broadcast;

#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Waits for the shutdown notice, returning at once if already received.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // A lag error still means the signal was sent.
        let _ = self.notify.recv().await;

        self.is_shutdown = true;
    }
}
