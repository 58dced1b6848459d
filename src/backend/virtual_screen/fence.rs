// SPDX-License-Identifier: GPL-3.0-only

use crate::utils::NodeId;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct FenceState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Synchronisation point signaled once the producer finished with a buffer.
///
/// A merged fence is signaled once every fence it was merged from is.
/// A fence without any parts is invalid.
#[derive(Debug, Clone, Default)]
pub struct SyncFence {
    parts: SmallVec<[Arc<FenceState>; 2]>,
}

impl SyncFence {
    pub fn new() -> SyncFence {
        SyncFence {
            parts: SmallVec::from_elem(Arc::new(FenceState::default()), 1),
        }
    }

    pub fn signaled() -> SyncFence {
        let fence = SyncFence::new();
        fence.signal();
        fence
    }

    pub fn invalid() -> SyncFence {
        SyncFence::default()
    }

    pub fn is_valid(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn signal(&self) {
        for part in &self.parts {
            *part.signaled.lock() = true;
            part.cond.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.is_valid() && self.parts.iter().all(|part| *part.signaled.lock())
    }

    /// Blocks until signaled or `timeout` passed. Returns whether the fence signaled.
    pub fn wait(&self, timeout: Duration) -> bool {
        if !self.is_valid() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        for part in &self.parts {
            let mut signaled = part.signaled.lock();
            while !*signaled {
                if part.cond.wait_until(&mut signaled, deadline).timed_out() {
                    return *signaled;
                }
            }
        }
        true
    }

    pub fn merge(&self, other: &SyncFence) -> SyncFence {
        let mut parts = self.parts.clone();
        for part in &other.parts {
            if !parts.iter().any(|known| Arc::ptr_eq(known, part)) {
                parts.push(part.clone());
            }
        }
        SyncFence { parts }
    }
}

/// Buffer of a hardware composited layer, shared with its display controller.
#[derive(Debug, Default)]
pub struct LayerBuffer {
    fence: Mutex<SyncFence>,
}

impl LayerBuffer {
    pub fn set_and_merge_sync_fence(&self, fence: &SyncFence) {
        let mut current = self.fence.lock();
        *current = if current.is_valid() {
            current.merge(fence)
        } else {
            fence.clone()
        };
    }

    pub fn sync_fence(&self) -> SyncFence {
        self.fence.lock().clone()
    }
}

/// Surface composited by the display controller on a screen instead of being drawn.
#[derive(Debug, Clone)]
pub struct HardwareLayer {
    pub id: NodeId,
    pub name: String,
    pub screen_id: NodeId,
    pub protected: bool,
    pub buffer: Option<Arc<LayerBuffer>>,
}

/// Acquire fences the render thread has to honour before reusing buffers.
#[derive(Debug, Clone, Default)]
pub struct FenceTracker {
    pending: Arc<Mutex<Option<SyncFence>>>,
}

impl FenceTracker {
    pub fn set_acquire_fence(&self, fence: &SyncFence) {
        let mut pending = self.pending.lock();
        *pending = Some(match pending.take() {
            Some(current) => current.merge(fence),
            None => fence.clone(),
        });
    }

    pub fn acquire_fence(&self) -> Option<SyncFence> {
        self.pending.lock().clone()
    }

    pub fn take_acquire_fence(&self) -> Option<SyncFence> {
        self.pending.lock().take()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merged_fence_waits_for_all() {
        let a = SyncFence::new();
        let b = SyncFence::new();
        let merged = a.merge(&b);
        assert!(merged.is_valid());
        a.signal();
        assert!(!merged.is_signaled());
        assert!(!merged.wait(Duration::from_millis(1)));
        b.signal();
        assert!(merged.is_signaled());
        assert!(merged.wait(Duration::from_millis(1)));

        assert!(!SyncFence::invalid().is_valid());
        assert!(!SyncFence::invalid().wait(Duration::ZERO));
        assert_eq!(a.merge(&a).parts.len(), 1);
    }

    #[test]
    fn signal_from_other_thread() {
        let fence = SyncFence::new();
        let remote = fence.clone();
        let handle = std::thread::spawn(move || remote.signal());
        assert!(fence.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn tracker_merges_pending() {
        let tracker = FenceTracker::default();
        assert!(tracker.acquire_fence().is_none());
        let a = SyncFence::new();
        let b = SyncFence::signaled();
        tracker.set_acquire_fence(&a);
        tracker.set_acquire_fence(&b);
        let pending = tracker.take_acquire_fence().unwrap();
        assert!(!pending.is_signaled());
        a.signal();
        assert!(pending.is_signaled());
        assert!(tracker.take_acquire_fence().is_none());
    }
}
