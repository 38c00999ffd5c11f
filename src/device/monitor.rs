//! Device-mode observation and the resume-from-sleep watcher.
//!
//! The telemetry loop publishes the device-mode byte into a
//! [`DeviceMonitor`]; the resume watcher blocks on its condition variable
//! for the class-specific byte sequence that marks a host sleep cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Observed device-mode byte plus a condition variable to wake waiters.
pub struct DeviceMonitor {
    status: Mutex<u8>,
    cond: Condvar,
}

impl Default for DeviceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMonitor {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Publish a fresh mode byte and wake every waiter.
    pub fn publish(&self, status: u8) {
        let mut current = self.status.lock().unwrap();
        if *current != status {
            *current = status;
            self.cond.notify_all();
        }
    }

    pub fn current(&self) -> u8 {
        *self.status.lock().unwrap()
    }

    /// Block until the status byte equals `value` or `running` clears.
    /// Returns false when shutdown interrupted the wait.
    pub fn wait_for(&self, value: u8, running: &AtomicBool) -> bool {
        let mut status = self.status.lock().unwrap();
        while *status != value {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(status, Duration::from_millis(500))
                .unwrap();
            status = next;
        }
        true
    }

    /// Block for the sleep-cycle flip: `first` then `second`.
    /// Returns false when shutdown interrupted the wait.
    pub fn wait_for_flip(&self, first: u8, second: u8, running: &AtomicBool) -> bool {
        self.wait_for(first, running) && self.wait_for(second, running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_publish_and_read() {
        let monitor = DeviceMonitor::new();
        monitor.publish(0x02);
        assert_eq!(monitor.current(), 0x02);
    }

    #[test]
    fn test_wait_for_flip_observes_sequence() {
        let monitor = Arc::new(DeviceMonitor::new());
        let running = Arc::new(AtomicBool::new(true));

        let watcher = {
            let monitor = Arc::clone(&monitor);
            let running = Arc::clone(&running);
            thread::spawn(move || monitor.wait_for_flip(0x02, 0x01, &running))
        };

        // quiescent, then in-progress
        monitor.publish(0x02);
        thread::sleep(Duration::from_millis(20));
        monitor.publish(0x01);

        assert!(watcher.join().unwrap());
    }

    #[test]
    fn test_shutdown_interrupts_wait() {
        let monitor = Arc::new(DeviceMonitor::new());
        let running = Arc::new(AtomicBool::new(true));

        let watcher = {
            let monitor = Arc::clone(&monitor);
            let running = Arc::clone(&running);
            thread::spawn(move || monitor.wait_for_flip(0x02, 0x01, &running))
        };

        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::SeqCst);
        assert!(!watcher.join().unwrap());
    }
}
