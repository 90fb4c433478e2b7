use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;

use crate::model::QueueEntry;
use crate::store::{StoreClient, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueMode {
    /// Take the head of the queue.
    Normal,
    /// Take a uniformly random entry.
    Random,
}

pub type QueueResult<T> = Result<T, StoreError>;

/// Ordered per-guild track queue. One contract, two implementations: the
/// store-backed queue used in production and an in-process queue selected by
/// `QUEUE_BACKEND=memory`. Semantics are identical; only durability differs.
#[async_trait]
pub trait TrackQueue: Send + Sync {
    /// Current entries in order. Empty when nothing was ever queued.
    async fn entries(&self) -> QueueResult<Vec<QueueEntry>>;

    /// Replace the whole queue.
    async fn replace(&self, entries: Vec<QueueEntry>) -> QueueResult<()>;

    /// Append one entry, returning the new length.
    async fn append(&self, entry: QueueEntry) -> QueueResult<usize>;

    /// Insert at `index`, clamped to the end.
    async fn insert_at(&self, index: usize, entry: QueueEntry) -> QueueResult<()>;

    /// Remove and return the entry at `index`, if it exists.
    async fn remove_at(&self, index: usize) -> QueueResult<Option<QueueEntry>>;

    /// Remove every entry the predicate matches, returning how many went.
    async fn remove_matching(
        &self,
        predicate: &(dyn for<'a> Fn(&'a QueueEntry) -> bool + Send + Sync),
    ) -> QueueResult<usize>;

    async fn clear(&self) -> QueueResult<()>;

    /// Uniformly permute the queue. The multiset of entries is unchanged.
    async fn shuffle(&self) -> QueueResult<()>;

    /// Remove and return the next entry per `mode`, or None when empty.
    async fn dequeue(&self, mode: DequeueMode) -> QueueResult<Option<QueueEntry>>;

    async fn peek(&self) -> QueueResult<Option<QueueEntry>>;

    async fn len(&self) -> QueueResult<usize>;

    async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Fisher-Yates: each position swaps with a uniformly chosen later-or-equal
/// position.
fn shuffle_in_place(entries: &mut [QueueEntry], rng: &mut impl Rng) {
    for index in 0..entries.len() {
        let target = index + rng.random_range(0..entries.len() - index);
        entries.swap(index, target);
    }
}

fn take_next(
    entries: &mut Vec<QueueEntry>,
    mode: DequeueMode,
    rng: &mut impl Rng,
) -> Option<QueueEntry> {
    if entries.is_empty() {
        return None;
    }
    let index = match mode {
        DequeueMode::Normal => 0,
        DequeueMode::Random => rng.random_range(0..entries.len()),
    };
    Some(entries.remove(index))
}

/// Store-backed queue for one guild. Every mutation goes through the store's
/// guarded read-modify-write, so concurrent mutators retry instead of
/// overwriting each other.
pub struct RedisQueue {
    store: StoreClient,
    guild: u64,
}

impl RedisQueue {
    pub fn new(store: StoreClient, guild: u64) -> Self {
        Self { store, guild }
    }
}

#[async_trait]
impl TrackQueue for RedisQueue {
    async fn entries(&self) -> QueueResult<Vec<QueueEntry>> {
        self.store.queue(self.guild).await
    }

    async fn replace(&self, entries: Vec<QueueEntry>) -> QueueResult<()> {
        self.store.set_queue(self.guild, &entries).await
    }

    async fn append(&self, entry: QueueEntry) -> QueueResult<usize> {
        self.store
            .update_queue(self.guild, move |list| {
                list.push(entry.clone());
                list.len()
            })
            .await
    }

    async fn insert_at(&self, index: usize, entry: QueueEntry) -> QueueResult<()> {
        self.store
            .update_queue(self.guild, move |list| {
                let at = index.min(list.len());
                list.insert(at, entry.clone());
            })
            .await
    }

    async fn remove_at(&self, index: usize) -> QueueResult<Option<QueueEntry>> {
        self.store
            .update_queue(self.guild, move |list| {
                if index < list.len() {
                    Some(list.remove(index))
                } else {
                    None
                }
            })
            .await
    }

    async fn remove_matching(
        &self,
        predicate: &(dyn for<'a> Fn(&'a QueueEntry) -> bool + Send + Sync),
    ) -> QueueResult<usize> {
        self.store
            .update_queue(self.guild, move |list| {
                let before = list.len();
                list.retain(|entry| !predicate(entry));
                before - list.len()
            })
            .await
    }

    async fn clear(&self) -> QueueResult<()> {
        self.store.clear_queue(self.guild).await
    }

    async fn shuffle(&self) -> QueueResult<()> {
        self.store
            .update_queue(self.guild, |list| {
                shuffle_in_place(list, &mut rand::rng());
            })
            .await
    }

    async fn dequeue(&self, mode: DequeueMode) -> QueueResult<Option<QueueEntry>> {
        self.store
            .update_queue(self.guild, move |list| {
                take_next(list, mode, &mut rand::rng())
            })
            .await
    }

    async fn peek(&self) -> QueueResult<Option<QueueEntry>> {
        Ok(self.store.queue(self.guild).await?.into_iter().next())
    }

    async fn len(&self) -> QueueResult<usize> {
        Ok(self.store.queue(self.guild).await?.len())
    }
}

/// In-process queue with the same semantics. Nothing survives a restart;
/// recovery then only covers guilds whose snapshot still names a track.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<QueueEntry>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackQueue for MemoryQueue {
    async fn entries(&self) -> QueueResult<Vec<QueueEntry>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn replace(&self, entries: Vec<QueueEntry>) -> QueueResult<()> {
        *self.entries.lock().await = entries;
        Ok(())
    }

    async fn append(&self, entry: QueueEntry) -> QueueResult<usize> {
        let mut list = self.entries.lock().await;
        list.push(entry);
        Ok(list.len())
    }

    async fn insert_at(&self, index: usize, entry: QueueEntry) -> QueueResult<()> {
        let mut list = self.entries.lock().await;
        let at = index.min(list.len());
        list.insert(at, entry);
        Ok(())
    }

    async fn remove_at(&self, index: usize) -> QueueResult<Option<QueueEntry>> {
        let mut list = self.entries.lock().await;
        if index < list.len() {
            Ok(Some(list.remove(index)))
        } else {
            Ok(None)
        }
    }

    async fn remove_matching(
        &self,
        predicate: &(dyn for<'a> Fn(&'a QueueEntry) -> bool + Send + Sync),
    ) -> QueueResult<usize> {
        let mut list = self.entries.lock().await;
        let before = list.len();
        list.retain(|entry| !predicate(entry));
        Ok(before - list.len())
    }

    async fn clear(&self) -> QueueResult<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn shuffle(&self) -> QueueResult<()> {
        shuffle_in_place(&mut *self.entries.lock().await, &mut rand::rng());
        Ok(())
    }

    async fn dequeue(&self, mode: DequeueMode) -> QueueResult<Option<QueueEntry>> {
        Ok(take_next(
            &mut *self.entries.lock().await,
            mode,
            &mut rand::rng(),
        ))
    }

    async fn peek(&self) -> QueueResult<Option<QueueEntry>> {
        Ok(self.entries.lock().await.first().cloned())
    }

    async fn len(&self) -> QueueResult<usize> {
        Ok(self.entries.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::model::TrackRef;

    fn entry(title: &str, requester: &str) -> QueueEntry {
        QueueEntry {
            track: TrackRef {
                url: format!("https://example.com/{title}"),
                title: title.to_string(),
                author: "artist".to_string(),
                duration_ms: Some(200_000),
                artwork_url: None,
                live: false,
            },
            requester: requester.to_string(),
        }
    }

    fn multiset(entries: &[QueueEntry]) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for e in entries {
            *counts.entry(e.track.title.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn shuffle_preserves_multiset() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in [0usize, 1, 2, 5, 40] {
            let original: Vec<_> = (0..len)
                .map(|i| entry(&format!("t{}", i % 3), "alice"))
                .collect();
            let mut shuffled = original.clone();
            shuffle_in_place(&mut shuffled, &mut rng);
            assert_eq!(multiset(&shuffled), multiset(&original), "len {len}");
            assert_eq!(shuffled.len(), original.len());
        }
    }

    #[test]
    fn shuffle_of_singleton_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut list = vec![entry("only", "bob")];
        shuffle_in_place(&mut list, &mut rng);
        assert_eq!(list[0].track.title, "only");
    }

    #[test]
    fn take_next_normal_pops_head() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut list = vec![entry("a", "alice"), entry("b", "bob")];
        let got = take_next(&mut list, DequeueMode::Normal, &mut rng).unwrap();
        assert_eq!(got.track.title, "a");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].track.title, "b");
    }

    #[test]
    fn take_next_random_stays_in_bounds_and_removes_one() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let mut list = vec![entry("a", "x"), entry("b", "x"), entry("c", "x")];
            let before = multiset(&list);
            let got = take_next(&mut list, DequeueMode::Random, &mut rng).unwrap();
            assert_eq!(list.len(), 2);
            let mut after = multiset(&list);
            *after.entry(got.track.title.clone()).or_insert(0) += 1;
            assert_eq!(after, before);
        }
    }

    #[test]
    fn take_next_on_empty_is_none() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(take_next(&mut Vec::new(), DequeueMode::Normal, &mut rng).is_none());
        assert!(take_next(&mut Vec::new(), DequeueMode::Random, &mut rng).is_none());
    }

    #[tokio::test]
    async fn memory_queue_appends_preserve_order() {
        let queue = MemoryQueue::new();
        queue.append(entry("a", "alice")).await.unwrap();
        let len = queue.append(entry("b", "bob")).await.unwrap();
        assert_eq!(len, 2);
        let titles: Vec<_> = queue
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.track.title)
            .collect();
        assert_eq!(titles, ["a", "b"]);
    }

    #[tokio::test]
    async fn memory_queue_remove_at_keeps_relative_order() {
        let queue = MemoryQueue::new();
        for title in ["a", "b", "c", "d"] {
            queue.append(entry(title, "alice")).await.unwrap();
        }
        let removed = queue.remove_at(1).await.unwrap().unwrap();
        assert_eq!(removed.track.title, "b");
        let titles: Vec<_> = queue
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.track.title)
            .collect();
        assert_eq!(titles, ["a", "c", "d"]);
        assert!(queue.remove_at(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_queue_remove_matching_counts() {
        let queue = MemoryQueue::new();
        for (title, who) in [("a", "alice"), ("b", "bob"), ("c", "alice")] {
            queue.append(entry(title, who)).await.unwrap();
        }
        let gone = queue
            .remove_matching(&|e| e.requester == "alice")
            .await
            .unwrap();
        assert_eq!(gone, 2);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(queue.peek().await.unwrap().unwrap().requester, "bob");
    }

    #[tokio::test]
    async fn remove_matching_works_through_trait_object() {
        let queue: Arc<dyn TrackQueue> = Arc::new(MemoryQueue::new());
        queue.append(entry("keep", "alice")).await.unwrap();
        queue.append(entry("drop", "bob")).await.unwrap();
        let target = "drop".to_string();
        let gone = queue
            .remove_matching(&|e| e.track.title == target)
            .await
            .unwrap();
        assert_eq!(gone, 1);
        assert_eq!(queue.peek().await.unwrap().unwrap().track.title, "keep");
    }

    #[tokio::test]
    async fn memory_queue_insert_clamps_to_end() {
        let queue = MemoryQueue::new();
        queue.append(entry("a", "alice")).await.unwrap();
        queue.insert_at(99, entry("z", "zed")).await.unwrap();
        queue.insert_at(0, entry("first", "fay")).await.unwrap();
        let titles: Vec<_> = queue
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.track.title)
            .collect();
        assert_eq!(titles, ["first", "a", "z"]);
    }

    #[tokio::test]
    async fn memory_queue_dequeue_drains_fifo() {
        let queue = MemoryQueue::new();
        for title in ["a", "b"] {
            queue.append(entry(title, "alice")).await.unwrap();
        }
        assert!(!queue.is_empty().await.unwrap());
        let first = queue.dequeue(DequeueMode::Normal).await.unwrap().unwrap();
        assert_eq!(first.track.title, "a");
        let second = queue.dequeue(DequeueMode::Normal).await.unwrap().unwrap();
        assert_eq!(second.track.title, "b");
        assert!(queue.dequeue(DequeueMode::Normal).await.unwrap().is_none());
        assert!(queue.is_empty().await.unwrap());
    }
}
