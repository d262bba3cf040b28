use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use octave_observability::trace::now_ms;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    error::{EngineError, EngineResult},
    protocol::{encode_request, rejection_reason},
};

pub type RequestResult = EngineResult<Value>;

/// Destination for encoded request lines (the worker's stdin).
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Writes one complete line. Concurrent callers must never interleave.
    async fn write_line(&self, line: &str) -> EngineResult<()>;

    /// Called when a write was abandoned at its deadline; a partial line may
    /// be on the wire, so nothing more should be written.
    fn mark_broken(&self) {}
}

struct PendingRequest {
    command: String,
    completion: oneshot::Sender<RequestResult>,
}

/// Handle returned by [`PendingTable::register`]; awaited through
/// [`PendingTable::wait`].
pub struct Ticket {
    pub id: String,
    pub command: String,
    pub deadline: Instant,
    rx: oneshot::Receiver<RequestResult>,
}

/// Outstanding requests keyed by correlation id.
///
/// Every entry is completed exactly once: by its response, by its deadline,
/// or by `fail_all` when the worker goes away. Removal and completion happen
/// under one lock, so the first of those wins and the rest are no-ops.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
    next_seq: AtomicU64,
}

struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    // A caller that stops awaiting must not leave its entry behind.
    fn drop(&mut self) {
        self.table.lock().remove(self.id);
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("req-{seq}-{}", now_ms())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn register(&self, command: &str, timeout: Duration) -> Ticket {
        loop {
            let id = self.next_id();
            if let Some(ticket) = self.insert(&id, command, timeout) {
                return ticket;
            }
        }
    }

    /// Registers under a caller-chosen id; `None` if that id is still pending.
    pub(crate) fn insert(&self, id: &str, command: &str, timeout: Duration) -> Option<Ticket> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return None;
        }
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id.to_string(),
            PendingRequest {
                command: command.to_string(),
                completion: tx,
            },
        );
        Some(Ticket {
            id: id.to_string(),
            command: command.to_string(),
            deadline: now + timeout,
            rx,
        })
    }

    fn complete(&self, id: &str, result: impl FnOnce(&str) -> RequestResult) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        // The caller may already be gone; nothing to do then.
        let _ = entry.completion.send(result(&entry.command));
        true
    }

    /// Routes a response. Unknown ids (late or duplicate answers) are ignored.
    pub fn resolve(&self, id: &str, ok: bool, data: Value) -> bool {
        self.complete(id, move |_| {
            if ok {
                Ok(data)
            } else {
                Err(EngineError::Rejected(rejection_reason(&data)))
            }
        })
    }

    pub fn expire(&self, id: &str) -> bool {
        self.complete(id, |command| {
            Err(EngineError::Timeout {
                command: command.to_string(),
            })
        })
    }

    pub fn fail(&self, id: &str, err: EngineError) -> bool {
        self.complete(id, move |_| Err(err))
    }

    /// Fails every outstanding request with `err`; returns how many there were.
    pub fn fail_all(&self, err: EngineError) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, v)| v).collect();
        let n = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Err(err.clone()));
        }
        n
    }

    /// Waits for the ticket's completion, expiring it at its deadline.
    pub async fn wait(&self, ticket: Ticket) -> RequestResult {
        let Ticket {
            id, deadline, mut rx, ..
        } = ticket;
        let _guard = PendingGuard { table: self, id: &id };

        let received = tokio::select! {
            res = &mut rx => res,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                // Either this expires the entry or a response got there first;
                // the receiver yields whichever completion won.
                self.expire(&id);
                rx.await
            }
        };
        received.unwrap_or_else(|_| {
            Err(EngineError::Unavailable(
                "engine request was dropped before completion".to_string(),
            ))
        })
    }

    /// Registers, writes the request line and awaits the outcome. A failed
    /// write fails only this request. The deadline covers the write too: a
    /// worker that stops reading its input cannot hold the caller past it.
    pub async fn submit(
        &self,
        sink: &dyn LineSink,
        command: &str,
        payload: &Value,
        timeout: Duration,
    ) -> RequestResult {
        let ticket = self.register(command, timeout);
        let line = match encode_request(&ticket.id, command, payload) {
            Ok(line) => line,
            Err(e) => {
                self.fail(&ticket.id, e.clone());
                return Err(e);
            }
        };
        let deadline = tokio::time::Instant::from_std(ticket.deadline);
        match tokio::time::timeout_at(deadline, sink.write_line(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fail(&ticket.id, e.clone());
                return Err(e);
            }
            Err(_) => {
                sink.mark_broken();
                self.expire(&ticket.id);
            }
        }
        self.wait(ticket).await
    }
}
