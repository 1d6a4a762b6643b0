//! Per-(device, stream) execution queues.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::sync::EventSignal;

/// Identifies one stream: device `-1` is the host back-end, `0..n` are GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub device: i32,
    pub index: u32,
}

impl StreamKey {
    pub fn new(device: i32, index: u32) -> Self {
        Self { device, index }
    }

    /// Whether this stream executes on the host back-end.
    pub fn host(&self) -> bool {
        self.device == -1
    }
}

/// Execution state of one stream.
///
/// `todo` holds the ids of variables queued for the next evaluation. Ids are
/// allocated monotonically and dependencies always point at older variables,
/// so iterating the set in order *is* a topological order.
pub struct Stream {
    pub key: StreamKey,
    pub todo: BTreeSet<u32>,
    /// Completion event shared with waiters outside the global lock.
    pub signal: Arc<EventSignal>,
    /// Fence value of the most recently enqueued kernel batch.
    pub fence: u64,
}

impl Stream {
    pub fn new(key: StreamKey) -> Self {
        Self { key, todo: BTreeSet::new(), signal: Arc::new(EventSignal::new()), fence: 0 }
    }

    /// Reserve the fence value for the next kernel launch.
    pub fn next_fence(&mut self) -> u64 {
        self.fence += 1;
        self.fence
    }

    /// Whether all enqueued work has completed.
    pub fn idle(&self) -> bool {
        self.signal.reached(self.fence)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.key)
            .field("todo", &self.todo.len())
            .field("fence", &self.fence)
            .field("signalled", &self.signal.value())
            .finish()
    }
}
