use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct Shutdown {
    stop: Mutex<bool>,
    cv: Condvar,
}

/// A named timer thread running a closure at a fixed cadence.
///
/// Periodic subtasks own nothing but their own state and a handle to the
/// surfaces they service; they must not assume exclusive access to heap
/// state beyond the monitoring and pacer interfaces.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn enroll(
        name: &'static str,
        interval: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> Self {
        let shutdown = Arc::new(Shutdown {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        });
        let sd = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                {
                    let mut stop = sd.stop.lock();
                    if *stop {
                        break;
                    }
                    let _ = sd.cv.wait_for(&mut stop, interval);
                    if *stop {
                        break;
                    }
                }
                task();
            })
            .expect("failed to spawn periodic task");
        debug!(name, interval_ms = interval.as_millis() as u64, "periodic task enrolled");
        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn disenroll(&mut self) {
        *self.shutdown.stop.lock() = true;
        self.shutdown.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!(name = self.name, "periodic task disenrolled");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.disenroll();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ticks_until_disenrolled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let mut task = PeriodicTask::enroll("test-ticker", Duration::from_millis(1), move || {
            t.fetch_add(1, Ordering::Relaxed);
        });
        while ticks.load(Ordering::Relaxed) < 3 {
            std::thread::yield_now();
        }
        task.disenroll();
        let after = ticks.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
    }

    #[test]
    fn disenroll_is_prompt_even_with_long_interval() {
        let start = std::time::Instant::now();
        let mut task = PeriodicTask::enroll("test-slow", Duration::from_secs(60), || {});
        task.disenroll();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
