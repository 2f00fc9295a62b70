use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Single-slot auto-reset signal.
///
/// [`set`](Self::set) releases exactly one waiter, the longest-waiting one.
/// With nobody waiting the signal latches, and the next
/// [`wait`](Self::wait) returns immediately and clears it. Repeated sets
/// with no waiter collapse into one.
#[derive(Default)]
pub struct AsyncSignal {
    state: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    signaled: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl AsyncSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release one waiter, or latch if there is none.
    pub fn set(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            // A dropped receiver is a waiter that gave up.
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.signaled = true;
    }

    /// Wait until the signal is set.
    pub async fn wait(&self) {
        if let Some(receiver) = self.enqueue() {
            let _ = receiver.await;
        }
    }

    /// Blocking variant of [`wait`](Self::wait).
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn wait_blocking(&self) {
        if let Some(receiver) = self.enqueue() {
            let _ = receiver.blocking_recv();
        }
    }

    /// Returns `true` if the signal is latched.
    pub fn is_set(&self) -> bool {
        self.state.lock().signaled
    }

    fn enqueue(&self) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state.lock();
        if state.signaled {
            state.signaled = false;
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        state.waiters.push_back(sender);
        Some(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn set_before_wait_latches_once() {
        let signal = AsyncSignal::new();
        signal.set();
        signal.set();
        assert!(signal.is_set());
        signal.wait().await;
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn set_releases_a_waiter() {
        let signal = Arc::new(AsyncSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.set();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn waiters_are_released_in_order() {
        let signal = Arc::new(AsyncSignal::new());
        let first = signal.enqueue().unwrap();
        let mut second = signal.enqueue().unwrap();

        signal.set();
        first.await.unwrap();
        assert!(second.try_recv().is_err());

        signal.set();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let signal = AsyncSignal::new();
        drop(signal.enqueue());
        let live = signal.enqueue().unwrap();
        signal.set();
        live.await.unwrap();
        assert!(!signal.is_set());
    }

    #[test]
    fn blocking_wait_from_another_thread() {
        let signal = Arc::new(AsyncSignal::new());
        let setter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                signal.set();
            })
        };
        signal.wait_blocking();
        setter.join().unwrap();
    }
}
