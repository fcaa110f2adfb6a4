//! Sticky control flags shared by the controller and both worker loops.
//!
//! A flag stays set until a consumer clears it; waiting on a flag that is
//! already set returns immediately, so a `set` can never be missed.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Flag {
    /// Terminal shutdown of the listen/recognize loop.
    SttStop,
    /// Terminal shutdown of the playback loop.
    TtsStop,
    /// Wake the interrupt watcher. It cancels the in-flight synthesis only
    /// if an immediate enqueue has superseded it, or unconditionally once
    /// `TtsStop` is set; on its own it leaves current playback running.
    /// Repeatable.
    TtsInterrupt,
    /// The keyword wait is satisfied: detected, skipped or shutting down.
    KeywordDone,
}

impl Flag {
    pub const ALL: [Flag; 4] = [
        Flag::SttStop,
        Flag::TtsStop,
        Flag::TtsInterrupt,
        Flag::KeywordDone,
    ];

    const fn index(self) -> usize {
        match self {
            Flag::SttStop => 0,
            Flag::TtsStop => 1,
            Flag::TtsInterrupt => 2,
            Flag::KeywordDone => 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct ControlSignals {
    flags: Mutex<[bool; 4]>,
    changed: Condvar,
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [bool; 4]> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, flag: Flag) {
        let mut flags = self.lock();
        if !flags[flag.index()] {
            flags[flag.index()] = true;
            self.changed.notify_all();
        }
        tracing::trace!(?flag, "signal set");
    }

    pub fn clear(&self, flag: Flag) {
        self.lock()[flag.index()] = false;
        tracing::trace!(?flag, "signal cleared");
    }

    pub fn is_set(&self, flag: Flag) -> bool {
        self.lock()[flag.index()]
    }

    /// Block until `flag` is set. Does not clear it.
    pub fn wait_until_set(&self, flag: Flag) {
        let mut flags = self.lock();
        while !flags[flag.index()] {
            flags = self
                .changed
                .wait(flags)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns `false` if the timeout elapsed with the flag still clear.
    pub fn wait_until_set_timeout(&self, flag: Flag, timeout: Duration) -> bool {
        self.wait_any_timeout(&[flag], timeout).is_some()
    }

    /// Block until any of `flags` is set and return the first one found set,
    /// in the order given. Blocks forever on an empty slice.
    pub fn wait_any(&self, flags: &[Flag]) -> Flag {
        let mut state = self.lock();
        loop {
            if let Some(flag) = flags.iter().copied().find(|f| state[f.index()]) {
                return flag;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_any_timeout(&self, flags: &[Flag], timeout: Duration) -> Option<Flag> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait_any(flags));
        };
        let mut state = self.lock();
        loop {
            if let Some(flag) = flags.iter().copied().find(|f| state[f.index()]) {
                return Some(flag);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn flags_are_independent() {
        let signals = ControlSignals::new();
        signals.set(Flag::KeywordDone);
        assert!(signals.is_set(Flag::KeywordDone));
        for flag in [Flag::SttStop, Flag::TtsStop, Flag::TtsInterrupt] {
            assert!(!signals.is_set(flag));
        }
        signals.clear(Flag::KeywordDone);
        assert!(Flag::ALL.iter().all(|f| !signals.is_set(*f)));
    }

    #[test]
    fn wait_returns_immediately_when_already_set() {
        let signals = ControlSignals::new();
        signals.set(Flag::TtsInterrupt);
        signals.wait_until_set(Flag::TtsInterrupt);
        assert!(signals.wait_until_set_timeout(Flag::TtsInterrupt, Duration::ZERO));
        // Waiting does not consume.
        assert!(signals.is_set(Flag::TtsInterrupt));
    }

    #[test]
    fn set_from_another_thread_wakes_waiter() {
        let signals = Arc::new(ControlSignals::new());
        let waiter = {
            let signals = Arc::clone(&signals);
            thread::spawn(move || signals.wait_until_set(Flag::SttStop))
        };
        thread::sleep(Duration::from_millis(20));
        signals.set(Flag::SttStop);
        waiter.join().unwrap();
    }

    #[test]
    fn timeout_elapses_when_flag_stays_clear() {
        let signals = ControlSignals::new();
        let started = Instant::now();
        assert!(!signals.wait_until_set_timeout(Flag::KeywordDone, Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_any_reports_first_set_flag_in_order() {
        let signals = ControlSignals::new();
        signals.set(Flag::SttStop);
        signals.set(Flag::KeywordDone);
        assert_eq!(
            signals.wait_any(&[Flag::KeywordDone, Flag::SttStop]),
            Flag::KeywordDone
        );
        assert_eq!(
            signals.wait_any_timeout(&[Flag::TtsStop], Duration::from_millis(5)),
            None
        );
    }

    #[test]
    fn setting_twice_is_idempotent() {
        let signals = ControlSignals::new();
        signals.set(Flag::TtsStop);
        signals.set(Flag::TtsStop);
        assert!(signals.is_set(Flag::TtsStop));
        signals.clear(Flag::TtsStop);
        assert!(!signals.is_set(Flag::TtsStop));
    }
}
