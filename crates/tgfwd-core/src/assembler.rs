//! Media-group reassembly.
//!
//! Upstream albums arrive as individual messages sharing a `group_id`.
//! The first message of a group schedules a flush; everything arriving
//! within the window joins the batch. Flushed batches are sorted
//! ascending by message id before the callback runs.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{domain::ChannelPost, mtproto::BoxFuture};

pub type AlbumSink = Arc<dyn Fn(Vec<ChannelPost>) -> BoxFuture + Send + Sync>;

pub struct MediaGroupAssembler {
    timeout: Duration,
    on_album: AlbumSink,
    pending: Mutex<HashMap<String, Vec<ChannelPost>>>,
}

impl MediaGroupAssembler {
    pub fn new(timeout: Duration, on_album: AlbumSink) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            on_album,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Buffer a grouped message. A late straggler (arriving after its
    /// group already flushed) opens a fresh buffer and ends up delivered
    /// as a singleton batch.
    pub async fn add(self: &Arc<Self>, post: ChannelPost) {
        let Some(group_id) = post.group_id.clone() else {
            (self.on_album)(vec![post]).await;
            return;
        };

        let mut pending = self.pending.lock().await;
        match pending.get_mut(&group_id) {
            Some(batch) => batch.push(post),
            None => {
                pending.insert(group_id.clone(), vec![post]);
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(this.timeout).await;
                    this.flush(&group_id).await;
                });
            }
        }
    }

    async fn flush(&self, group_id: &str) {
        // Take the batch under the lock, run the callback outside it.
        let batch = self.pending.lock().await.remove(group_id);
        let Some(mut batch) = batch else {
            return;
        };
        batch.sort_by_key(|m| m.msg_id);
        (self.on_album)(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId, MessageKind};
    use std::sync::Mutex as StdMutex;
    use tokio::time::{advance, Duration};

    fn post(id: i64, group: Option<&str>) -> ChannelPost {
        ChannelPost {
            chat_id: ChatId(-1001234567890),
            chat_title: Some("chan".to_string()),
            chat_handle: None,
            msg_id: MessageId(id),
            group_id: group.map(|g| g.to_string()),
            kind: MessageKind::Photo,
            text: None,
            entities: None,
            file_size: Some(1024),
            file_name: None,
            poll: None,
            location: None,
            contact: None,
        }
    }

    fn collecting_sink() -> (AlbumSink, Arc<StdMutex<Vec<Vec<i64>>>>) {
        let seen: Arc<StdMutex<Vec<Vec<i64>>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_sink = seen.clone();
        let sink: AlbumSink = Arc::new(move |batch: Vec<ChannelPost>| {
            let seen = seen_for_sink.clone();
            Box::pin(async move {
                seen.lock()
                    .unwrap()
                    .push(batch.iter().map(|m| m.msg_id.0).collect());
            })
        });
        (sink, seen)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_group_once_sorted_ascending() {
        let (sink, seen) = collecting_sink();
        let asm = MediaGroupAssembler::new(Duration::from_secs(2), sink);

        asm.add(post(205, Some("g"))).await;
        asm.add(post(203, Some("g"))).await;
        asm.add(post(204, Some("g"))).await;

        advance(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![vec![203, 204, 205]]);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_groups_flush_independently() {
        let (sink, seen) = collecting_sink();
        let asm = MediaGroupAssembler::new(Duration::from_secs(2), sink);

        asm.add(post(10, Some("a"))).await;
        asm.add(post(20, Some("b"))).await;
        asm.add(post(11, Some("a"))).await;

        advance(Duration::from_secs(3)).await;
        settle().await;

        let mut batches = seen.lock().unwrap().clone();
        batches.sort();
        assert_eq!(batches, vec![vec![10, 11], vec![20]]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_straggler_becomes_singleton() {
        let (sink, seen) = collecting_sink();
        let asm = MediaGroupAssembler::new(Duration::from_secs(2), sink);

        asm.add(post(1, Some("g"))).await;
        advance(Duration::from_secs(3)).await;
        settle().await;

        asm.add(post(2, Some("g"))).await;
        advance(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn ungrouped_message_passes_straight_through() {
        let (sink, seen) = collecting_sink();
        let asm = MediaGroupAssembler::new(Duration::from_secs(2), sink);

        asm.add(post(5, None)).await;
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![vec![5]]);
    }
}
