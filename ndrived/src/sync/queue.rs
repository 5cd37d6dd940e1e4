use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::dao::DocPair;
use super::states::PairState;

/// What the processor needs to act on a pair, stamped with the version the
/// pair had when enqueued. The processor re-reads the row and skips stale
/// stamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub pair_id: i64,
    pub folderish: bool,
    pub pair_state: PairState,
    pub version: i64,
}

impl From<&DocPair> for QueueItem {
    fn from(pair: &DocPair) -> Self {
        Self {
            pair_id: pair.id,
            folderish: pair.folderish,
            pair_state: pair.pair_state,
            version: pair.version,
        }
    }
}

fn channel_of(item: &QueueItem) -> usize {
    let local = matches!(
        item.pair_state,
        PairState::LocallyCreated
            | PairState::LocallyModified
            | PairState::LocallyMoved
            | PairState::LocallyMovedCreated
            | PairState::LocallyMovedRemotelyModified
            | PairState::LocallyDeleted
            | PairState::LocallyResolved
            | PairState::DirectTransfer
            | PairState::DeletedUnknown
    );
    match (local, item.folderish) {
        (true, true) => 0,  // local folder
        (true, false) => 1, // local file
        (false, _) => 2,    // remote
    }
}

#[derive(Default)]
struct Inner {
    queues: [VecDeque<QueueItem>; 3],
    queued: HashSet<i64>,
    suspended: bool,
    closed: bool,
}

/// Three FIFO queues (local folder, local file, remote) with at-most-once
/// membership per pair and bounded capacity. Folder work drains before file
/// work so parents exist before children and children vanish before
/// parents.
pub struct QueueManager {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Signalled when an item lands or the state flips.
    items: Notify,
    /// Signalled when space frees up.
    space: Notify,
}

impl QueueManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("queue poisoned");
        inner.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues a pair unless it is already waiting. Blocks (without
    /// dropping) while every slot is taken.
    pub async fn push(&self, item: QueueItem) {
        if item.pair_state.is_quiescent() {
            return;
        }
        loop {
            // Register interest before the check so a wakeup between the
            // unlock and the await is not lost.
            let space = self.space.notified();
            {
                let mut inner = self.inner.lock().expect("queue poisoned");
                if inner.closed {
                    return;
                }
                if inner.queued.contains(&item.pair_id) {
                    return;
                }
                let total: usize = inner.queues.iter().map(VecDeque::len).sum();
                if total < self.capacity {
                    inner.queued.insert(item.pair_id);
                    inner.queues[channel_of(&item)].push_back(item);
                    drop(inner);
                    self.items.notify_waiters();
                    return;
                }
            }
            space.await;
        }
    }

    /// Next item in drain order, or `None` once the queue is closed. Waits
    /// while empty or suspended.
    pub async fn pop(&self) -> Option<QueueItem> {
        loop {
            let items = self.items.notified();
            {
                let mut inner = self.inner.lock().expect("queue poisoned");
                if inner.closed {
                    return None;
                }
                if !inner.suspended {
                    let slot = (0..3).find(|idx| !inner.queues[*idx].is_empty());
                    if let Some(idx) = slot {
                        let item = inner.queues[idx].pop_front().expect("checked non-empty");
                        inner.queued.remove(&item.pair_id);
                        drop(inner);
                        self.space.notify_waiters();
                        return Some(item);
                    }
                }
            }
            items.await;
        }
    }

    /// Stops drains; items keep accumulating and running handlers finish on
    /// their own.
    pub fn suspend(&self) {
        self.inner.lock().expect("queue poisoned").suspended = true;
    }

    pub fn resume(&self) {
        self.inner.lock().expect("queue poisoned").suspended = false;
        self.items.notify_waiters();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().expect("queue poisoned").suspended
    }

    /// Permanently wakes every waiter; subsequent pops return `None`.
    pub fn close(&self) {
        self.inner.lock().expect("queue poisoned").closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn item(pair_id: i64, folderish: bool, state: PairState) -> QueueItem {
        QueueItem {
            pair_id,
            folderish,
            pair_state: state,
            version: 1,
        }
    }

    #[tokio::test]
    async fn folders_drain_before_files() {
        let queue = QueueManager::new(16);
        queue.push(item(1, false, PairState::LocallyCreated)).await;
        queue.push(item(2, true, PairState::LocallyCreated)).await;
        queue.push(item(3, false, PairState::RemotelyCreated)).await;

        assert_eq!(queue.pop().await.unwrap().pair_id, 2);
        assert_eq!(queue.pop().await.unwrap().pair_id, 1);
        assert_eq!(queue.pop().await.unwrap().pair_id, 3);
    }

    #[tokio::test]
    async fn fifo_within_a_queue() {
        let queue = QueueManager::new(16);
        queue.push(item(1, false, PairState::LocallyCreated)).await;
        queue.push(item(2, false, PairState::LocallyModified)).await;
        assert_eq!(queue.pop().await.unwrap().pair_id, 1);
        assert_eq!(queue.pop().await.unwrap().pair_id, 2);
    }

    #[tokio::test]
    async fn a_pair_is_enqueued_at_most_once() {
        let queue = QueueManager::new(16);
        queue.push(item(1, false, PairState::LocallyCreated)).await;
        queue.push(item(1, false, PairState::LocallyModified)).await;
        assert_eq!(queue.len(), 1);

        // Once popped, the pair may be enqueued again.
        queue.pop().await.unwrap();
        queue.push(item(1, false, PairState::LocallyModified)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn synchronized_pairs_are_never_enqueued() {
        let queue = QueueManager::new(16);
        queue.push(item(1, false, PairState::Synchronized)).await;
        queue.push(item(2, false, PairState::Conflicted)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn suspend_holds_back_drains() {
        let queue = Arc::new(QueueManager::new(16));
        queue.push(item(1, false, PairState::LocallyCreated)).await;
        queue.suspend();

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!popper.is_finished());

        queue.resume();
        assert_eq!(popper.await.unwrap().unwrap().pair_id, 1);
    }

    #[tokio::test]
    async fn push_blocks_when_full_instead_of_dropping() {
        let queue = Arc::new(QueueManager::new(1));
        queue.push(item(1, false, PairState::LocallyCreated)).await;

        let pusher = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.push(item(2, false, PairState::LocallyCreated)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pusher.is_finished());

        assert_eq!(queue.pop().await.unwrap().pair_id, 1);
        pusher.await.unwrap();
        assert_eq!(queue.pop().await.unwrap().pair_id, 2);
    }

    #[tokio::test]
    async fn close_releases_waiting_poppers() {
        let queue = Arc::new(QueueManager::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(popper.await.unwrap().is_none());
    }
}
