use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::oneshot, time::Instant};

use crate::{SdamError, Server, ServerAddress, ServerSelector};

#[derive(Debug)]
pub(crate) enum WaitQueueCallback {
    Select(oneshot::Sender<Result<Arc<Server>, SdamError>>),
    /// The readiness gate of `connect()`.
    Connect(oneshot::Sender<Result<(), SdamError>>),
}

/// One caller waiting for a suitable server.
#[derive(Debug)]
pub(crate) struct WaitQueueMember {
    pub(crate) id: u64,
    pub(crate) selector: ServerSelector,
    pub(crate) pinned_server: Option<ServerAddress>,
    pub(crate) timeout: Duration,
    callback: WaitQueueCallback,
}

impl WaitQueueMember {
    /// The caller stopped waiting, for example because its future was dropped.
    pub(crate) fn is_abandoned(&self) -> bool {
        match &self.callback {
            WaitQueueCallback::Select(sender) => sender.is_closed(),
            WaitQueueCallback::Connect(sender) => sender.is_closed(),
        }
    }

    pub(crate) fn is_connect(&self) -> bool {
        matches!(self.callback, WaitQueueCallback::Connect(_))
    }

    pub(crate) fn resolve(self, server: Arc<Server>) {
        match self.callback {
            WaitQueueCallback::Select(sender) => {
                let _ = sender.send(Ok(server));
            }
            WaitQueueCallback::Connect(sender) => {
                let _ = sender.send(Ok(()));
            }
        }
    }

    pub(crate) fn fail(self, error: SdamError) {
        match self.callback {
            WaitQueueCallback::Select(sender) => {
                let _ = sender.send(Err(error));
            }
            WaitQueueCallback::Connect(sender) => {
                let _ = sender.send(Err(error));
            }
        }
    }
}

/// FIFO of pending selections, with a min-heap of their deadlines next to it so the actor
/// can sleep until the earliest one.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    members: VecDeque<WaitQueueMember>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(
        &mut self,
        selector: ServerSelector,
        pinned_server: Option<ServerAddress>,
        timeout: Duration,
        callback: WaitQueueCallback,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + timeout;
        self.deadlines.push(Reverse((deadline, id)));
        self.members.push_back(WaitQueueMember {
            id,
            selector,
            pinned_server,
            timeout,
            callback,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The earliest deadline of a member still in the queue. Heap entries of members that
    /// already left are discarded on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.members.iter().any(|m| m.id == id) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Removes and returns every member whose deadline is at or before `now`, in queue order.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<WaitQueueMember> {
        let mut expired_ids = HashSet::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            expired_ids.insert(id);
        }
        if expired_ids.is_empty() {
            return Vec::new();
        }

        let (expired, remaining): (VecDeque<_>, VecDeque<_>) = self
            .members
            .drain(..)
            .partition(|m| expired_ids.contains(&m.id));
        self.members = remaining;
        expired.into_iter().collect()
    }

    /// Offers every member, oldest first, to `serve`. A member handed back stays queued in its
    /// original position relative to the others.
    pub(crate) fn process(
        &mut self,
        mut serve: impl FnMut(WaitQueueMember) -> Option<WaitQueueMember>,
    ) {
        let pending = std::mem::take(&mut self.members);
        for member in pending {
            if let Some(unmet) = serve(member) {
                self.members.push_back(unmet);
            }
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<WaitQueueMember> {
        self.deadlines.clear();
        self.members.drain(..).collect()
    }
}
