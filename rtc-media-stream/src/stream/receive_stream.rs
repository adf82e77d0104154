//! Registry of the inbound streams of a media stream, one per remote SSRC.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::collaborators::ReceiveStreamHandle;

/// Inbound media of one remote SSRC.
pub struct ReceiveStream {
    ssrc: u32,
    data_source: Option<String>,
    created: Instant,
    last_activity: Mutex<Option<Instant>>,
}

impl fmt::Debug for ReceiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveStream")
            .field("ssrc", &self.ssrc)
            .field("data_source", &self.data_source)
            .field("last_activity", &*self.last_activity.lock())
            .finish()
    }
}

impl ReceiveStream {
    pub fn new(ssrc: u32, data_source: Option<String>, now: Instant) -> Self {
        Self {
            ssrc,
            data_source,
            created: now,
            last_activity: Mutex::new(None),
        }
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn touch(&self, now: Instant) {
        *self.last_activity.lock() = Some(now);
    }
}

impl ReceiveStreamHandle for ReceiveStream {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn data_source(&self) -> Option<&str> {
        self.data_source.as_deref()
    }

    fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock()
    }
}

/// Receive streams by SSRC.
///
/// Writers downgrade to a read lock before running their notification, so
/// readers are not held up by a slow consumer and no other writer can slip
/// in between the change and its notification.
#[derive(Debug, Default)]
pub struct ReceiveStreamRegistry {
    streams: RwLock<HashMap<u32, Arc<ReceiveStream>>>,
}

impl ReceiveStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `stream` unless its SSRC is already present, then calls `notify`
    /// with the added stream under the read lock. Returns false when the
    /// SSRC was known.
    pub fn add<F>(&self, stream: ReceiveStream, notify: F) -> bool
    where
        F: FnOnce(&ReceiveStream),
    {
        let mut streams = self.streams.write();
        if streams.contains_key(&stream.ssrc) {
            return false;
        }
        let stream = Arc::new(stream);
        streams.insert(stream.ssrc, Arc::clone(&stream));
        debug!("receive stream {} added", stream.ssrc);

        let _streams = RwLockWriteGuard::downgrade(streams);
        notify(&stream);
        true
    }

    /// Removes the stream of `ssrc`, calling `notify` under the read lock.
    pub fn remove<F>(&self, ssrc: u32, notify: F) -> Option<Arc<ReceiveStream>>
    where
        F: FnOnce(&ReceiveStream),
    {
        let mut streams = self.streams.write();
        let removed = streams.remove(&ssrc)?;
        debug!("receive stream {ssrc} removed");

        let _streams = RwLockWriteGuard::downgrade(streams);
        notify(&removed);
        Some(removed)
    }

    pub fn get(&self, ssrc: u32) -> Option<Arc<ReceiveStream>> {
        self.streams.read().get(&ssrc).cloned()
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.streams.read().contains_key(&ssrc)
    }

    /// Snapshot, ordered by SSRC.
    pub fn all(&self) -> Vec<Arc<ReceiveStream>> {
        let mut all: Vec<_> = self.streams.read().values().cloned().collect();
        all.sort_by_key(|s| s.ssrc);
        all
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Removes every stream, calling `notify` for each under the read lock.
    pub fn clear<F>(&self, mut notify: F)
    where
        F: FnMut(&ReceiveStream),
    {
        let mut streams = self.streams.write();
        let mut removed: Vec<_> = streams.drain().map(|(_, s)| s).collect();
        removed.sort_by_key(|s| s.ssrc);

        let _streams = RwLockWriteGuard::downgrade(streams);
        for stream in &removed {
            notify(stream);
        }
    }
}
