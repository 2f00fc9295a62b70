use tracing::error;

use crate::error::StoreError;

/// A callback handed to a [`Dispatcher`].
pub type Callback = Box<dyn FnOnce() + Send>;

/// Where query refreshes, property changes and load callbacks run, and
/// where command failures are reported.
///
/// A UI application marshals callbacks onto its UI thread here. The store
/// never waits for a dispatched callback to finish.
pub trait Dispatcher: Send + Sync {
    /// Run `callback`, now or later, on any thread.
    fn dispatch(&self, callback: Callback);

    /// Report a command that failed on the store worker.
    fn on_error(&self, error: &StoreError) {
        error!(%error, "store command failed");
    }
}

/// Runs every callback immediately on the calling thread (the store worker).
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, callback: Callback) {
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn inline_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        InlineDispatcher.dispatch(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_error_hook_does_not_panic() {
        InlineDispatcher.on_error(&StoreError::MailboxClosed);
    }
}
