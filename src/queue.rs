use crate::registry::DiscoveredRequest;
use alloy::primitives::Address;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscoveryLane {
    /// Pushed by a live bucket watcher; drained first.
    Live,
    /// Found by the backfill traversal; acceptable to drop under pressure.
    Backfill,
}

struct DiscoveryQueueState {
    live: VecDeque<DiscoveredRequest>,
    backfill: VecDeque<DiscoveredRequest>,
    queued: HashSet<Address>,
    max_len: usize,
    closed: bool,
}

impl DiscoveryQueueState {
    fn len(&self) -> usize {
        self.live.len().saturating_add(self.backfill.len())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_next(&mut self) -> Option<DiscoveredRequest> {
        if let Some(req) = self.live.pop_front() {
            self.queued.remove(&req.address);
            return Some(req);
        }
        if let Some(req) = self.backfill.pop_front() {
            self.queued.remove(&req.address);
            return Some(req);
        }
        None
    }

    fn evict_one_backfill(&mut self) -> bool {
        // Evict the newest backfill work first. This keeps earlier backlog stable.
        if let Some(req) = self.backfill.pop_back() {
            self.queued.remove(&req.address);
            return true;
        }
        false
    }
}

struct DiscoveryQueueInner {
    state: Mutex<DiscoveryQueueState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct DiscoveryQueueSender {
    inner: Arc<DiscoveryQueueInner>,
}

pub struct DiscoveryQueueReceiver {
    inner: Arc<DiscoveryQueueInner>,
}

/// Single internal discovery channel: every discovery source pushes candidate
/// records here and one dispatcher task drains them into the cache, so
/// callback fan-out stays bounded no matter how many watchers are live.
pub struct DiscoveryQueue;

impl DiscoveryQueue {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(max_len: usize) -> (DiscoveryQueueSender, DiscoveryQueueReceiver) {
        let max_len = std::cmp::max(1, max_len);
        let inner = Arc::new(DiscoveryQueueInner {
            state: Mutex::new(DiscoveryQueueState {
                live: VecDeque::new(),
                backfill: VecDeque::new(),
                queued: HashSet::new(),
                max_len,
                closed: false,
            }),
            notify: Notify::new(),
        });
        (
            DiscoveryQueueSender {
                inner: Arc::clone(&inner),
            },
            DiscoveryQueueReceiver { inner },
        )
    }
}

impl DiscoveryQueueSender {
    /// Enqueue a discovered candidate.
    ///
    /// Returns `true` if it was accepted, `false` if it was dropped (already
    /// queued, queue full of live work, or queue closed).
    pub async fn enqueue(&self, request: DiscoveredRequest, lane: DiscoveryLane) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return false;
        }
        if state.queued.contains(&request.address) {
            return false;
        }

        while state.len() >= state.max_len {
            let evicted = match lane {
                DiscoveryLane::Live => state.evict_one_backfill(),
                DiscoveryLane::Backfill => false,
            };
            if !evicted {
                return false;
            }
        }

        state.queued.insert(request.address);
        match lane {
            DiscoveryLane::Live => state.live.push_back(request),
            DiscoveryLane::Backfill => state.backfill.push_back(request),
        }
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

impl DiscoveryQueueReceiver {
    pub async fn recv(&mut self) -> Option<DiscoveredRequest> {
        loop {
            let notified = {
                let mut state = self.inner.state.lock().await;
                if let Some(request) = state.pop_next() {
                    return Some(request);
                }
                if state.closed && state.is_empty() {
                    return None;
                }
                self.inner.notify.notified()
            };
            notified.await;
        }
    }
}
