//! Local and remote synchronization source identities.

use std::fmt;

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use shared::error::{Error, Result};

/// Returned by [`SsrcFactory::generate`] when a send stream is torn down on
/// purpose rather than renumbered.
pub const SSRC_SENTINEL: u32 = u32::MAX;

/// Cause passed to [`SsrcFactory::generate`] when a send stream is removed.
pub const REMOVE_SEND_STREAM_CAUSE: &str = "remove-send-stream";

/// Generates SSRCs from a fast, non-cryptographic generator.
pub struct SsrcFactory {
    rng: SmallRng,
    initial: Option<u32>,
}

impl fmt::Debug for SsrcFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsrcFactory")
            .field("initial", &self.initial)
            .finish()
    }
}

impl SsrcFactory {
    pub fn new(initial: Option<u32>) -> Self {
        Self {
            rng: SmallRng::from_os_rng(),
            initial,
        }
    }

    /// Deterministic generator, for reproducible sequences in tests.
    pub fn with_seed(initial: Option<u32>, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            initial,
        }
    }

    /// Re-arms the value returned by the next call to [`SsrcFactory::generate`].
    pub fn set_initial(&mut self, ssrc: u32) {
        self.initial = Some(ssrc);
    }

    pub fn generate(&mut self, cause: Option<&str>) -> u32 {
        if cause == Some(REMOVE_SEND_STREAM_CAUSE) {
            return SSRC_SENTINEL;
        }
        if let Some(initial) = self.initial.take() {
            return initial;
        }
        loop {
            let ssrc = self.rng.random::<u32>();
            if ssrc != SSRC_SENTINEL {
                return ssrc;
            }
        }
    }
}

impl Default for SsrcFactory {
    fn default() -> Self {
        Self::new(None)
    }
}

pub type LocalSsrcChangeFn = Box<dyn Fn(Option<u32>, u32) + Send + Sync>;

/// Tracks the stream's own SSRC and every SSRC seen from the remote side.
#[derive(Default)]
pub struct SsrcManager {
    local: Option<u32>,
    locked: bool,
    remote: Vec<u32>,
    handlers: Vec<LocalSsrcChangeFn>,
}

impl fmt::Debug for SsrcManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsrcManager")
            .field("local", &self.local)
            .field("locked", &self.locked)
            .field("remote", &self.remote)
            .finish()
    }
}

impl SsrcManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_source_id(&self) -> Option<u32> {
        self.local
    }

    /// Replaces the local SSRC and notifies change handlers.
    ///
    /// Returns the previous value, or `ErrLocalSsrcLocked` once a send
    /// stream has been created with the current value.
    pub fn set_local_source_id(&mut self, ssrc: u32) -> Result<Option<u32>> {
        let old = self.local;
        if old == Some(ssrc) {
            return Ok(old);
        }
        if self.locked {
            return Err(Error::ErrLocalSsrcLocked);
        }

        debug!("local ssrc {:?} -> {}", old, ssrc);
        self.local = Some(ssrc);
        for handler in &self.handlers {
            handler(old, ssrc);
        }
        Ok(old)
    }

    pub fn on_local_ssrc_change(&mut self, handler: LocalSsrcChangeFn) {
        self.handlers.push(handler);
    }

    /// Freezes the local SSRC while a send stream uses it.
    pub fn lock_local(&mut self) {
        self.locked = true;
    }

    pub fn unlock_local(&mut self) {
        self.locked = false;
    }

    pub fn is_local_locked(&self) -> bool {
        self.locked
    }

    /// Records a remote SSRC as the most recent one. Returns true when it was
    /// not known before.
    pub fn add_remote_source_id(&mut self, ssrc: u32) -> bool {
        let existed = match self.remote.iter().position(|s| *s == ssrc) {
            Some(pos) => {
                self.remote.remove(pos);
                true
            }
            None => false,
        };
        self.remote.push(ssrc);
        !existed
    }

    /// The most recently added remote SSRC.
    pub fn remote_source_id(&self) -> Option<u32> {
        self.remote.last().copied()
    }

    pub fn remote_source_ids(&self) -> Vec<u32> {
        self.remote.clone()
    }

    pub fn contains_remote(&self, ssrc: u32) -> bool {
        self.remote.contains(&ssrc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ssrc_factory_initial_value_first() {
        let mut factory = SsrcFactory::with_seed(Some(0xCAFE), 1);
        assert_eq!(factory.generate(None), 0xCAFE);
        // the second value comes from the generator, not the initial slot
        let second = factory.generate(None);
        assert_ne!(second, SSRC_SENTINEL);
    }

    #[test]
    fn test_ssrc_factory_sentinel_keeps_initial() {
        let mut factory = SsrcFactory::with_seed(Some(7), 1);
        assert_eq!(factory.generate(Some(REMOVE_SEND_STREAM_CAUSE)), SSRC_SENTINEL);
        assert_eq!(factory.generate(Some("new-send-stream")), 7);
    }

    #[test]
    fn test_ssrc_factory_never_sentinel_without_cause() {
        let mut factory = SsrcFactory::with_seed(None, 42);
        for _ in 0..10_000 {
            assert_ne!(factory.generate(None), SSRC_SENTINEL);
        }
    }

    #[test]
    fn test_ssrc_factory_set_initial() {
        let mut factory = SsrcFactory::with_seed(None, 3);
        factory.generate(None);
        factory.set_initial(99);
        assert_eq!(factory.generate(None), 99);
    }

    #[test]
    fn test_ssrc_manager_remote_order() {
        let mut manager = SsrcManager::new();
        assert!(manager.add_remote_source_id(1));
        assert!(manager.add_remote_source_id(2));
        assert!(!manager.add_remote_source_id(1));

        assert_eq!(manager.remote_source_ids(), vec![2, 1]);
        assert_eq!(manager.remote_source_id(), Some(1));
        assert!(manager.contains_remote(2));
    }

    #[test]
    fn test_ssrc_manager_local_change_and_lock() {
        let mut manager = SsrcManager::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = Arc::clone(&seen);
        manager.on_local_ssrc_change(Box::new(move |_, new| {
            seen2.store(new, Ordering::SeqCst);
        }));

        assert_eq!(manager.set_local_source_id(10), Ok(None));
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        manager.lock_local();
        assert_eq!(
            manager.set_local_source_id(11),
            Err(Error::ErrLocalSsrcLocked)
        );
        // setting the same value is not a change
        assert_eq!(manager.set_local_source_id(10), Ok(Some(10)));

        manager.unlock_local();
        assert_eq!(manager.set_local_source_id(11), Ok(Some(10)));
        assert_eq!(manager.local_source_id(), Some(11));
    }
}
