//! Event fan-out for install progress and console output.
//!
//! Every category is a [`Topic`]: one tokio `broadcast` channel per instance id,
//! created on first subscription and released when the last subscriber goes
//! away. Publishing never blocks; a subscriber that falls more than the channel
//! capacity behind skips the overflow instead of stalling the installer or the
//! server readers. Events for one id keep their emission order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ─── Wire types ──────────────────────────────────────────────

/// `install-progress` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub server_id: String,
    /// 0–100, never decreasing within one job.
    pub progress: u8,
    pub task: String,
    /// `null` while healthy and on success, `true` on failure.
    pub error: Option<bool>,
    /// Set on the last event of a job.
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl InstallProgress {
    pub fn running(server_id: &str, progress: u8, task: impl Into<String>) -> Self {
        Self {
            server_id: server_id.to_string(),
            progress,
            task: task.into(),
            error: None,
            done: false,
            detail: None,
            exit_code: None,
        }
    }

    pub fn succeeded(server_id: &str) -> Self {
        Self {
            done: true,
            ..Self::running(server_id, 100, "Installation completed successfully")
        }
    }

    pub fn failed(
        server_id: &str,
        progress: u8,
        task: impl Into<String>,
        detail: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            progress,
            task: task.into(),
            error: Some(true),
            done: true,
            detail,
            exit_code,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the daemon itself (start, stop, exit code).
    System,
}

/// `console-output` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLine {
    pub server_id: String,
    /// Sequence number within the current process run, for `?since=` polling.
    pub id: u64,
    pub timestamp: u64,
    pub stream: LogSource,
    pub data: String,
}

/// Envelope pushed over the websocket / SSE streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    InstallProgress(InstallProgress),
    ConsoleOutput(ConsoleLine),
}

// ─── Topic ───────────────────────────────────────────────────

struct TopicInner<T> {
    channels: Mutex<HashMap<String, broadcast::Sender<T>>>,
    firehose: broadcast::Sender<T>,
    capacity: usize,
}

/// Id-keyed publish/subscribe channel. Cheap to clone.
pub struct Topic<T> {
    inner: Arc<TopicInner<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(TopicInner {
                channels: Mutex::new(HashMap::new()),
                firehose,
                capacity,
            }),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<T>>> {
        // A poisoned map only means a panic elsewhere while holding the lock;
        // the map itself is still consistent.
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send `event` to every subscriber of `id` and to firehose listeners.
    pub fn publish(&self, id: &str, event: T) {
        let _ = self.inner.firehose.send(event.clone());
        let sender = self.channels().get(id).cloned();
        if let Some(tx) = sender {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to events for `id` emitted from now on.
    pub fn subscribe(&self, id: &str) -> Subscription<T> {
        let rx = {
            let mut map = self.channels();
            map.entry(id.to_string())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        Subscription {
            id: id.to_string(),
            rx: Some(rx),
            topic: self.clone(),
        }
    }

    /// Receiver for every id.
    pub fn firehose(&self) -> broadcast::Receiver<T> {
        self.inner.firehose.subscribe()
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        self.channels()
            .get(id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn release(&self, id: &str) {
        let mut map = self.channels();
        if map.get(id).map(|tx| tx.receiver_count() == 0).unwrap_or(false) {
            map.remove(id);
            tracing::debug!("Released event channel for '{}'", id);
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription<T: Clone + Send + 'static> {
    id: String,
    rx: Option<broadcast::Receiver<T>>,
    topic: Topic<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Subscriber for '{}' lagged, skipped {} events", self.id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a stream; the stream owns the guard.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let next = sub.recv().await?;
            Some((next, sub))
        })
    }
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.topic.release(&self.id);
    }
}

// ─── Broadcaster ─────────────────────────────────────────────

/// The two process-wide event categories.
#[derive(Clone)]
pub struct EventBroadcaster {
    pub install: Topic<InstallProgress>,
    pub console: Topic<ConsoleLine>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            install: Topic::new(capacity),
            console: Topic::new(capacity),
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn line(id: &str, seq: u64) -> ConsoleLine {
        ConsoleLine {
            server_id: id.to_string(),
            id: seq,
            timestamp: 0,
            stream: LogSource::Stdout,
            data: format!("line {}", seq),
        }
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let topic: Topic<ConsoleLine> = Topic::new(8);
        topic.publish("alpha", line("alpha", 0));
        assert_eq!(topic.subscriber_count("alpha"), 0);
    }

    #[tokio::test]
    async fn delivers_in_order_per_id() {
        let topic: Topic<ConsoleLine> = Topic::new(64);
        let mut sub = topic.subscribe("alpha");
        for i in 0..10 {
            topic.publish("alpha", line("alpha", i));
        }
        for i in 0..10 {
            assert_eq!(sub.recv().await.unwrap().id, i);
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_their_id() {
        let topic: Topic<ConsoleLine> = Topic::new(8);
        let mut alpha = topic.subscribe("alpha");
        let _bravo = topic.subscribe("bravo");
        topic.publish("bravo", line("bravo", 0));
        topic.publish("alpha", line("alpha", 1));
        let got = alpha.recv().await.unwrap();
        assert_eq!(got.server_id, "alpha");
        assert_eq!(got.id, 1);
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_replay() {
        let topic: Topic<ConsoleLine> = Topic::new(8);
        let _early = topic.subscribe("alpha");
        topic.publish("alpha", line("alpha", 0));
        let mut late = topic.subscribe("alpha");
        topic.publish("alpha", line("alpha", 1));
        assert_eq!(late.recv().await.unwrap().id, 1);
    }

    #[test]
    fn dropping_last_subscriber_releases_channel() {
        let topic: Topic<ConsoleLine> = Topic::new(8);
        let a = topic.subscribe("alpha");
        let b = topic.subscribe("alpha");
        assert_eq!(topic.subscriber_count("alpha"), 2);
        drop(a);
        assert_eq!(topic.subscriber_count("alpha"), 1);
        drop(b);
        assert_eq!(topic.subscriber_count("alpha"), 0);
        assert!(topic.channels().get("alpha").is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_publisher() {
        let topic: Topic<ConsoleLine> = Topic::new(4);
        let mut slow = topic.subscribe("alpha");
        for i in 0..100 {
            topic.publish("alpha", line("alpha", i));
        }
        // Overflow is skipped; the newest events are still delivered in order.
        let first = slow.recv().await.unwrap().id;
        let second = slow.recv().await.unwrap().id;
        assert!(first >= 96);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn firehose_sees_every_id() {
        let topic: Topic<InstallProgress> = Topic::new(8);
        let mut all = topic.firehose();
        topic.publish("alpha", InstallProgress::running("alpha", 5, "Authenticating"));
        topic.publish("bravo", InstallProgress::succeeded("bravo"));
        assert_eq!(all.recv().await.unwrap().server_id, "alpha");
        assert_eq!(all.recv().await.unwrap().server_id, "bravo");
    }

    #[tokio::test]
    async fn stream_drop_unsubscribes() {
        let topic: Topic<ConsoleLine> = Topic::new(8);
        let stream = topic.subscribe("alpha").into_stream();
        let mut stream = Box::pin(stream);
        topic.publish("alpha", line("alpha", 7));
        assert_eq!(stream.next().await.unwrap().id, 7);
        drop(stream);
        assert_eq!(topic.subscriber_count("alpha"), 0);
    }

    #[test]
    fn wire_shapes() {
        let ok = serde_json::to_value(ServerEvent::InstallProgress(InstallProgress::succeeded("alpha"))).unwrap();
        assert_eq!(ok["event"], "install-progress");
        assert_eq!(ok["payload"]["serverId"], "alpha");
        assert_eq!(ok["payload"]["progress"], 100);
        assert!(ok["payload"]["error"].is_null());

        let failed = InstallProgress::failed("alpha", 40, "Installation failed", None, Some(8));
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["error"], true);
        assert_eq!(v["exitCode"], 8);

        let console = serde_json::to_value(ServerEvent::ConsoleOutput(line("alpha", 3))).unwrap();
        assert_eq!(console["event"], "console-output");
        assert_eq!(console["payload"]["data"], "line 3");
        assert_eq!(console["payload"]["stream"], "stdout");
    }
}
