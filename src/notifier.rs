//! User-facing notification seam.
//!
//! Desktop toast presentation belongs to an external shell; the core only
//! needs somewhere to put the few messages a user must actually see
//! (missing config, busy port). Wire parsing noise never goes here.

use tracing::warn;

/// Something that can surface a short title and body to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Notifier that writes to the log, for headless runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        warn!("{} {}", title, message);
    }
}
