//! Status snapshot and event fan-out.
//!
//! The reader task feeds every decoded message through
//! [`Broadcaster::on_message`]. Responses go to the pending table; events
//! update the snapshot first and are then republished, in arrival order, to
//! subscribers registered for that event name or for [`ALL_EVENTS`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::{
    pending::PendingTable,
    protocol::{
        InboundMessage, WorkerEvent, EVENT_ERROR, EVENT_READY, EVENT_RUNTIME, EVENT_STATUS,
        EVENT_STDERR,
    },
};

/// Topic that receives every event.
pub const ALL_EVENTS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Stopped,
    Launching,
    Ready,
    Active,
    Error,
}

impl Phase {
    fn from_running(running: bool) -> Self {
        if running {
            Phase::Active
        } else {
            Phase::Stopped
        }
    }

    /// Phase reported by a status event. Labels outside the known set (the
    /// worker says "starting" while its capture loop spins up) fall back to
    /// what `running` implies.
    pub fn from_worker(label: Option<&str>, running: bool) -> Self {
        match label.map(str::trim) {
            Some("stopped") => Phase::Stopped,
            Some("launching") => Phase::Launching,
            Some("ready") => Phase::Ready,
            Some("active") => Phase::Active,
            Some("error") => Phase::Error,
            _ => Phase::from_running(running),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub connected: bool,
    pub running: bool,
    pub phase: Phase,
    pub last_error: String,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::stopped(String::new())
    }
}

impl StatusSnapshot {
    pub fn stopped(last_error: String) -> Self {
        Self {
            connected: false,
            running: false,
            phase: Phase::Stopped,
            last_error,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Text shown for an error event: `error`, then `traceback`, then `stage`.
pub fn error_text(data: &Value) -> String {
    ["error", "traceback", "stage"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or("Engine error")
        .to_string()
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, HashMap<u64, mpsc::UnboundedSender<WorkerEvent>>>,
    topic_of: HashMap<u64, String>,
}

impl Registry {
    fn remove(&mut self, id: u64) -> bool {
        let Some(topic) = self.topic_of.remove(&id) else {
            return false;
        };
        if let Some(subs) = self.topics.get_mut(&topic) {
            subs.remove(&id);
            if subs.is_empty() {
                self.topics.remove(&topic);
            }
        }
        true
    }

    fn deliver(&mut self, topic: &str, ev: &WorkerEvent) {
        let mut closed = Vec::new();
        if let Some(subs) = self.topics.get(topic) {
            for (id, tx) in subs {
                if tx.send(ev.clone()).is_err() {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            self.remove(id);
        }
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<WorkerEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event; `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry).remove(self.id);
        }
    }
}

pub struct Broadcaster {
    status: watch::Sender<StatusSnapshot>,
    runtime: Mutex<Option<Value>>,
    registry: Arc<Mutex<Registry>>,
    next_subscriber: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (status, _rx) = watch::channel(StatusSnapshot::default());
        Self {
            status,
            runtime: Mutex::new(None),
            registry: Arc::new(Mutex::new(Registry::default())),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn last_runtime(&self) -> Option<Value> {
        self.runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replaces the snapshot atomically and returns the new value.
    pub fn update_status(&self, f: impl FnOnce(&mut StatusSnapshot)) -> StatusSnapshot {
        self.status.send_modify(f);
        self.snapshot()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut reg = lock_registry(&self.registry);
            reg.topics
                .entry(topic.to_string())
                .or_default()
                .insert(id, tx);
            reg.topic_of.insert(id, topic.to_string());
        }
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        lock_registry(&self.registry).remove(id)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock_registry(&self.registry)
            .topics
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Sends `ev` to its topic and to wildcard subscribers.
    pub fn publish(&self, ev: WorkerEvent) {
        // Delivery happens under the lock so every subscriber sees one global order.
        let mut reg = lock_registry(&self.registry);
        reg.deliver(&ev.name, &ev);
        if ev.name != ALL_EVENTS {
            reg.deliver(ALL_EVENTS, &ev);
        }
    }

    /// Publishes the current snapshot as an `engine.status` event.
    pub fn publish_status(&self) {
        let snapshot = self.snapshot();
        self.publish(WorkerEvent::new(EVENT_STATUS, snapshot.to_json()));
    }

    pub fn on_message(&self, msg: InboundMessage, pending: &PendingTable) {
        match msg {
            InboundMessage::Response { id, ok, data } => {
                pending.resolve(&id, ok, data);
            }
            InboundMessage::Event(ev) => self.on_event(ev),
        }
    }

    pub fn on_event(&self, ev: WorkerEvent) {
        match ev.name.as_str() {
            EVENT_READY => {
                self.status.send_replace(StatusSnapshot {
                    connected: true,
                    running: false,
                    phase: Phase::Ready,
                    last_error: String::new(),
                });
            }
            EVENT_STATUS => {
                let running = truthy(ev.data.get("running"));
                let phase = Phase::from_worker(ev.data_str("phase"), running);
                self.status.send_modify(|s| {
                    s.running = running;
                    s.phase = phase;
                });
            }
            EVENT_RUNTIME => {
                *self
                    .runtime
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ev.data.clone());
            }
            EVENT_ERROR => {
                let text = error_text(&ev.data);
                self.status.send_modify(|s| {
                    s.running = false;
                    s.phase = Phase::Error;
                    s.last_error = text;
                });
            }
            _ => {}
        }
        self.publish(ev);
    }

    /// Worker diagnostics. Blank chunks are skipped.
    pub fn on_stderr(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.publish(WorkerEvent::new(
            EVENT_STDERR,
            serde_json::json!({ "text": text }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_line;
    use serde_json::json;
    use std::time::Duration;

    fn event(name: &str, data: Value) -> WorkerEvent {
        WorkerEvent::new(name, data)
    }

    #[test]
    fn ready_event_connects_and_clears_error() {
        let b = Broadcaster::new();
        b.update_status(|s| s.last_error = "old failure".to_string());
        b.on_event(event(EVENT_READY, json!({"pid": 42})));
        assert_eq!(
            b.snapshot(),
            StatusSnapshot {
                connected: true,
                running: false,
                phase: Phase::Ready,
                last_error: String::new(),
            }
        );
    }

    #[test]
    fn status_event_defaults_phase_from_running() {
        let b = Broadcaster::new();
        b.on_event(event(EVENT_READY, json!({})));
        b.on_event(event(EVENT_STATUS, json!({"running": true})));
        let s = b.snapshot();
        assert!(s.connected);
        assert!(s.running);
        assert_eq!(s.phase, Phase::Active);

        b.on_event(event(EVENT_STATUS, json!({"running": false})));
        assert_eq!(b.snapshot().phase, Phase::Stopped);
    }

    #[test]
    fn status_event_keeps_last_error_and_uses_explicit_phase() {
        let b = Broadcaster::new();
        b.update_status(|s| s.last_error = "camera busy".to_string());
        b.on_event(event(EVENT_STATUS, json!({"running": true, "phase": "ready"})));
        let s = b.snapshot();
        assert_eq!(s.phase, Phase::Ready);
        assert_eq!(s.last_error, "camera busy");
        assert!(!s.connected);
    }

    #[test]
    fn unknown_phase_label_follows_running_flag() {
        let b = Broadcaster::new();
        b.on_event(event(EVENT_STATUS, json!({"running": true, "phase": "starting"})));
        assert_eq!(b.snapshot().phase, Phase::Active);
    }

    #[test]
    fn error_event_with_only_stage_uses_stage_text() {
        let b = Broadcaster::new();
        b.on_event(event(EVENT_READY, json!({})));
        b.on_event(event(EVENT_STATUS, json!({"running": true})));
        b.on_event(event(EVENT_ERROR, json!({"stage": "camera_open"})));
        let s = b.snapshot();
        assert_eq!(s.last_error, "camera_open");
        assert_eq!(s.phase, Phase::Error);
        assert!(!s.running);
        assert!(s.connected);
    }

    #[test]
    fn error_text_precedence() {
        assert_eq!(
            error_text(&json!({"error": "boom", "traceback": "tb", "stage": "s"})),
            "boom"
        );
        assert_eq!(error_text(&json!({"traceback": "tb", "stage": "s"})), "tb");
        assert_eq!(error_text(&json!({"error": "", "stage": "s"})), "s");
        assert_eq!(error_text(&json!({})), "Engine error");
    }

    #[test]
    fn runtime_event_is_stored_without_status_change() {
        let b = Broadcaster::new();
        let before = b.snapshot();
        b.on_event(event(EVENT_RUNTIME, json!({"fps": 29.7, "mode": "gesture"})));
        assert_eq!(b.snapshot(), before);
        assert_eq!(b.last_runtime(), Some(json!({"fps": 29.7, "mode": "gesture"})));
    }

    #[test]
    fn subscribers_only_see_their_topic_and_wildcard_sees_all_in_order() {
        let b = Broadcaster::new();
        let mut status = b.subscribe(EVENT_STATUS);
        let mut all = b.subscribe(ALL_EVENTS);

        b.on_event(event(EVENT_READY, json!({})));
        b.on_event(event("engine.voice", json!({"text": "next slide"})));
        b.on_event(event(EVENT_STATUS, json!({"running": true})));

        let got = status.try_recv().expect("status event");
        assert_eq!(got.data, json!({"running": true}));
        assert!(status.try_recv().is_none());

        let names: Vec<String> = std::iter::from_fn(|| all.try_recv())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![EVENT_READY, "engine.voice", EVENT_STATUS]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let b = Broadcaster::new();
        let sub = b.subscribe(EVENT_ERROR);
        let keep = b.subscribe(EVENT_ERROR);
        assert_eq!(b.subscriber_count(EVENT_ERROR), 2);
        drop(sub);
        assert_eq!(b.subscriber_count(EVENT_ERROR), 1);
        assert!(b.unsubscribe(keep.id()));
        assert!(!b.unsubscribe(keep.id()));
        assert_eq!(b.subscriber_count(EVENT_ERROR), 0);
    }

    #[test]
    fn stderr_text_is_trimmed_and_blank_chunks_skipped() {
        let b = Broadcaster::new();
        let mut sub = b.subscribe(EVENT_STDERR);
        b.on_stderr("   \n");
        b.on_stderr("WARNING: model fallback to cpu\n");
        let got = sub.try_recv().expect("stderr event");
        assert_eq!(got.data, json!({"text": "WARNING: model fallback to cpu"}));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn responses_go_to_pending_table_not_subscribers() {
        let b = Broadcaster::new();
        let table = PendingTable::new();
        let mut all = b.subscribe(ALL_EVENTS);
        let ticket = table
            .insert("req-7", "ping", Duration::from_secs(5))
            .expect("insert");

        let line = r#"{"type":"response","id":"req-7","ok":true,"data":{"x":1}}"#;
        b.on_message(decode_line(line).expect("decode"), &table);

        assert_eq!(table.wait(ticket).await, Ok(json!({"x": 1})));
        assert!(all.try_recv().is_none());
    }

    #[tokio::test]
    async fn watch_receiver_sees_snapshot_changes() {
        let b = Broadcaster::new();
        let mut rx = b.watch();
        b.on_event(event(EVENT_READY, json!({})));
        rx.changed().await.expect("changed");
        assert_eq!(rx.borrow().phase, Phase::Ready);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let s = StatusSnapshot::stopped("gone".to_string());
        assert_eq!(
            s.to_json(),
            json!({"connected": false, "running": false, "phase": "stopped", "lastError": "gone"})
        );
    }
}
