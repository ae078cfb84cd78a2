use std::sync::atomic::{AtomicUsize, Ordering};

const UNSET: usize = 0;
const SET: usize = 1;

/// A level-triggered boolean signal shared between the control thread and
/// requester threads.
///
/// The atomic operations serialize with respect to each other only; a flag
/// carries no ordering guarantees for unrelated data. Cross-thread
/// visibility of the data protected by a flag is established by the
/// condition variable used to wake the observer, not by the flag itself.
pub struct SignalFlag {
    bits: AtomicUsize,
}

impl SignalFlag {
    pub const fn new() -> Self {
        Self {
            bits: AtomicUsize::new(UNSET),
        }
    }

    pub fn set(&self) {
        self.bits.store(SET, Ordering::Release);
    }

    pub fn unset(&self) {
        self.bits.store(UNSET, Ordering::Release);
    }

    pub fn set_cond(&self, value: bool) {
        if value {
            self.set();
        } else {
            self.unset();
        }
    }

    /// Sets the flag if it was clear. Returns true iff this call changed it.
    pub fn try_set(&self) -> bool {
        self.bits
            .compare_exchange(UNSET, SET, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears the flag if it was set. Returns true iff this call changed it.
    pub fn try_unset(&self) -> bool {
        self.bits
            .compare_exchange(SET, UNSET, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.bits.load(Ordering::Acquire) == SET
    }

    pub fn is_unset(&self) -> bool {
        !self.is_set()
    }
}

impl Default for SignalFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_set_is_exclusive() {
        let flag = SignalFlag::new();
        assert!(flag.is_unset());
        assert!(flag.try_set());
        assert!(!flag.try_set());
        assert!(flag.is_set());
        assert!(flag.try_unset());
        assert!(!flag.try_unset());
        assert!(flag.is_unset());
    }

    #[test]
    fn only_one_thread_wins_try_set() {
        use std::sync::Arc;

        let flag = Arc::new(SignalFlag::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = flag.clone();
            handles.push(std::thread::spawn(move || f.try_set()));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(flag.is_set());
    }
}
