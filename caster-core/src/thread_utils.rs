use std::{
    sync::{Condvar, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use tracing::{Level, span};

/// Manual-reset event in the style of Win32/os_event: once set it stays
/// signaled until explicitly reset, waking every waiter.
pub(crate) struct ManualResetEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new(signaled: bool) -> Self {
        Self {
            state: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = self.state.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut signaled = self.state.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
    }

    /// Waits until the event is signaled or the timeout elapses. Returns
    /// true if the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let signaled = self.state.lock().unwrap();
        let (signaled, _result) = self
            .cond
            .wait_timeout_while(signaled, timeout, |signaled| !*signaled)
            .unwrap();
        *signaled
    }
}

/// Spawns a worker with a readable thread name and an entered tracing span
/// identifying the owning output.
pub(crate) fn spawn_named<F>(thread_name: &str, instance: String, body: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let name = thread_name.to_string();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _span = span!(Level::INFO, "Thread", thread = name, instance).entered();
            body()
        })
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_reset_event_latches() {
        let event = Arc::new(ManualResetEvent::new(false));
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(10)));

        event.set();
        assert!(event.is_set());
        // stays signaled for any number of waits
        event.wait();
        event.wait();
        assert!(event.wait_timeout(Duration::from_millis(1)));

        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_manual_reset_event_wakes_waiter() {
        let event = Arc::new(ManualResetEvent::new(false));
        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(waiter.join().unwrap());
    }
}
