use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nerva_core::{
    CreateOptions, KernelError, Message, MessageFactory, MessageId, MessagePath, Pkr,
    ResponseRequired,
};

/// Correlator tuning.
#[derive(Clone, Copy, Debug)]
pub struct CorrelatorConfig {
    /// How many resolved correlation ids to remember so late replies get
    /// "already resolved" rather than "unknown".
    pub recent_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 1024,
        }
    }
}

/// A caller's registered intent to wait for a response.
#[derive(Clone, Debug, Serialize)]
pub struct PendingResponse {
    pub correlation_id: MessageId,
    pub owner: Pkr,
    pub reply_to: String,
    pub timeout_ms: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

struct PendingEntry {
    info: PendingResponse,
    timer: Option<CancellationToken>,
}

/// Outcome of [`ResponseCorrelator::handle_response`].
#[derive(Debug)]
pub enum ResponseMatch {
    /// The response paired with a live pending entry; deliver to its
    /// `reply_to`.
    Matched(PendingResponse),
    /// No live entry; the response is dropped with this reason.
    Unmatched { reason: String },
}

impl ResponseMatch {
    pub fn is_matched(&self) -> bool {
        matches!(self, ResponseMatch::Matched(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    Resolved,
    TimedOut,
    Cancelled,
}

/// Bounded memory of recently settled correlation ids so a late reply gets
/// "already resolved" rather than "unknown".
#[derive(Default)]
struct RecentLog {
    order: VecDeque<MessageId>,
    entries: HashMap<MessageId, Resolution>,
}

impl RecentLog {
    fn record(&mut self, id: MessageId, resolution: Resolution, capacity: usize) {
        if self.entries.insert(id, resolution).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }
}

/// Registers pending responses, pairs incoming responses with them, and
/// emits synthetic timeout responses when a reply never comes.
///
/// At-most-one resolution per correlation id: the pending entry's removal
/// from the map is the linearization point, so exactly one of a real
/// response and the timeout timer observes the entry. Timer expiry never
/// touches kernel state directly — the synthetic message goes onto a
/// channel the kernel drains on its own task.
pub struct ResponseCorrelator {
    config: CorrelatorConfig,
    factory: Arc<MessageFactory>,
    pending: DashMap<MessageId, PendingEntry>,
    by_owner: DashMap<Pkr, Vec<MessageId>>,
    recent: Mutex<RecentLog>,
    timeout_tx: mpsc::UnboundedSender<Message>,
}

impl ResponseCorrelator {
    /// Returns the correlator plus the receiver the kernel drains for
    /// synthetic timeout responses.
    pub fn new(
        factory: Arc<MessageFactory>,
        config: CorrelatorConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Self {
            config,
            factory,
            pending: DashMap::new(),
            by_owner: DashMap::new(),
            recent: Mutex::new(RecentLog::default()),
            timeout_tx,
        });
        (correlator, timeout_rx)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register a pending response for `message`, keyed by its id. The id
    /// must be globally unused; the reply path must parse. A positive
    /// timeout starts the expiry timer.
    pub fn register(
        self: &Arc<Self>,
        owner: Pkr,
        message: &Message,
        response: &ResponseRequired,
    ) -> Result<(), KernelError> {
        let id = message.id();
        MessagePath::parse(&response.reply_to)?;
        if self.pending.contains_key(&id) || self.recent.lock().expect("recent log poisoned").contains(id)
        {
            return Err(KernelError::validation(format!(
                "correlation id '{}' is already registered",
                id
            )));
        }

        let timeout_ms = response.timeout_ms;
        let timer = if timeout_ms > 0 {
            let token = CancellationToken::new();
            let weak: Weak<Self> = Arc::downgrade(self);
            let child = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = child.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                        if let Some(correlator) = weak.upgrade() {
                            correlator.expire(id);
                        }
                    }
                }
            });
            Some(token)
        } else {
            None
        };

        let info = PendingResponse {
            correlation_id: id,
            owner,
            reply_to: response.reply_to.clone(),
            timeout_ms,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.by_owner.entry(owner).or_default().push(id);
        self.pending.insert(id, PendingEntry { info, timer });
        tracing::debug!(correlation_id = %id, owner = %owner, timeout_ms, "pending response registered");
        Ok(())
    }

    /// Timer callback: settle the entry as timed out and emit the
    /// synthetic error response toward the registered reply path.
    fn expire(&self, id: MessageId) {
        let Some((_, entry)) = self.pending.remove(&id) else {
            // Lost the race against a real response.
            return;
        };
        self.unindex(entry.info.owner, id);
        self.recent
            .lock()
            .expect("recent log poisoned")
            .record(id, Resolution::TimedOut, self.config.recent_capacity);

        let body = json!({
            "timeout": entry.info.timeout_ms,
            "correlationId": id.to_string(),
            "reason": "Command timed out",
            "inReplyTo": id.to_string(),
        });
        let options = CreateOptions::default().in_reply_to(id);
        match self
            .factory
            .create_error(&entry.info.reply_to, body, options)
        {
            Ok(synthetic) => {
                tracing::debug!(correlation_id = %id, reply_to = %entry.info.reply_to, "pending response timed out");
                // Receiver gone means the kernel is shutting down; nothing
                // left to notify.
                let _ = self.timeout_tx.send(synthetic);
            }
            Err(err) => {
                tracing::warn!(correlation_id = %id, error = %err, "could not build timeout response");
            }
        }
    }

    /// Pair a response with its pending entry. The correlation id comes
    /// from `explicit`, else the message's `inReplyTo` meta, else an
    /// `inReplyTo` body field.
    pub fn handle_response(
        &self,
        message: &Message,
        explicit: Option<MessageId>,
    ) -> ResponseMatch {
        let Some(id) = explicit.or_else(|| message.in_reply_to()) else {
            return ResponseMatch::Unmatched {
                reason: "response carries no correlation id".to_string(),
            };
        };

        match self.pending.remove(&id) {
            Some((_, entry)) => {
                if let Some(timer) = &entry.timer {
                    timer.cancel();
                }
                self.unindex(entry.info.owner, id);
                self.recent
                    .lock()
                    .expect("recent log poisoned")
                    .record(id, Resolution::Resolved, self.config.recent_capacity);
                tracing::debug!(correlation_id = %id, "response matched");
                ResponseMatch::Matched(entry.info)
            }
            None => {
                let reason = if self
                    .recent
                    .lock()
                    .expect("recent log poisoned")
                    .contains(id)
                {
                    "already resolved".to_string()
                } else {
                    format!("no pending response for correlation id '{}'", id)
                };
                ResponseMatch::Unmatched { reason }
            }
        }
    }

    /// Drop a pending entry without resolving it. Idempotent.
    pub fn cancel(&self, id: MessageId) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                if let Some(timer) = &entry.timer {
                    timer.cancel();
                }
                self.unindex(entry.info.owner, id);
                self.recent
                    .lock()
                    .expect("recent log poisoned")
                    .record(id, Resolution::Cancelled, self.config.recent_capacity);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending entry registered by `owner` (used when its
    /// principal is disposed). Returns how many were dropped.
    pub fn cancel_for_owner(&self, owner: Pkr) -> usize {
        let ids = self
            .by_owner
            .remove(&owner)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                if let Some(timer) = &entry.timer {
                    timer.cancel();
                }
                self.recent
                    .lock()
                    .expect("recent log poisoned")
                    .record(id, Resolution::Cancelled, self.config.recent_capacity);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel every live pending entry (runtime shutdown). Returns how
    /// many were dropped.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(id) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// The registered reply path for a live pending entry.
    pub fn get_reply_to(&self, id: MessageId) -> Option<String> {
        self.pending.get(&id).map(|entry| entry.info.reply_to.clone())
    }

    fn unindex(&self, owner: Pkr, id: MessageId) {
        if let Some(mut ids) = self.by_owner.get_mut(&owner) {
            ids.retain(|candidate| *candidate != id);
        }
    }
}
