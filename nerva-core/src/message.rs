use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;
use crate::ids::{MessageId, Pkr, SenderId, TraceId, TransactionId};

/// Creation-time meta keys that freeze into [`FixedMeta::custom`].
///
/// Anything else supplied at creation lands in the mutable half.
pub const FIXED_CUSTOM_KEYS: &[&str] = &["replyTo", "correlationId", "inReplyTo"];

// ── Path ────────────────────────────────────────────────────────────────────

/// A parsed `scheme://segment[/segment...]` destination.
///
/// The scheme names the destination subsystem; segments are matched against
/// route patterns by the destination's router. Wildcards and captures are
/// only legal in patterns, never in message paths.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MessagePath {
    raw: String,
    scheme: String,
    segments: Vec<String>,
}

impl MessagePath {
    /// Parse and normalise a path. Trailing slashes are stripped.
    pub fn parse(input: &str) -> Result<Self, KernelError> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| KernelError::validation(format!("path '{}' is missing '://'", input)))?;

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KernelError::validation(format!(
                "path '{}' has an invalid scheme",
                input
            )));
        }

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(KernelError::validation(format!(
                "path '{}' has no segments",
                input
            )));
        }

        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(KernelError::validation(format!(
                "path '{}' contains an empty segment",
                input
            )));
        }

        let raw = format!("{}://{}", scheme, rest);
        Ok(Self {
            raw,
            scheme: scheme.to_string(),
            segments,
        })
    }

    /// The destination subsystem name.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The scheme-less route part, e.g. `layers/42`.
    pub fn route(&self) -> String {
        self.segments.join("/")
    }

    /// The full normalised path text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessagePath({})", self.raw)
    }
}

impl std::str::FromStr for MessagePath {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MessagePath {
    type Error = KernelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MessagePath> for String {
    fn from(path: MessagePath) -> Self {
        path.raw
    }
}

// ── Meta ────────────────────────────────────────────────────────────────────

/// Message classification, derived from creation options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Simple,
    Atomic,
    Batch,
    Query,
    Command,
    Retry,
    Transaction,
    Error,
}

/// The five derived flags stamped into fixed meta at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub is_atomic: bool,
    pub is_batch: bool,
    pub is_query: bool,
    pub is_command: bool,
    pub is_error: bool,
}

/// The immutable half of a message's metadata.
///
/// Frozen at creation — a `Message` hands out shared references only, so
/// there is no way to mutate this after the factory returns. Creation-time
/// custom keys (see [`FIXED_CUSTOM_KEYS`]) freeze into `custom`.
#[derive(Debug, Serialize)]
pub struct FixedMeta {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message_type: MessageType,
    pub trace_id: TraceId,
    pub max_retries: u32,
    pub caller: Option<Pkr>,
    pub sender_id: Option<SenderId>,
    pub transaction_id: Option<TransactionId>,
    pub seq: Option<u32>,
    pub flags: MessageFlags,
    pub custom: BTreeMap<String, Value>,
}

impl FixedMeta {
    /// A frozen custom key set at creation, e.g. `inReplyTo`.
    pub fn custom_key(&self, key: &str) -> Option<&Value> {
        self.custom.get(key)
    }
}

/// The mutable half of a message's metadata: retry bookkeeping, query
/// results, and arbitrary per-hop runtime keys.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MutableMeta {
    pub retries: u32,
    pub query_result: Option<Value>,
    pub extra: BTreeMap<String, Value>,
}

// ── Message ─────────────────────────────────────────────────────────────────

/// The typed envelope routed between subsystems.
///
/// Cloning a `Message` is cheap and yields a handle to the same envelope:
/// the fixed meta is shared (and immutable), and runtime annotations made
/// through one clone are visible through the others.
#[derive(Clone, Debug)]
pub struct Message {
    id: MessageId,
    path: MessagePath,
    body: Arc<Value>,
    fixed: Arc<FixedMeta>,
    mutable: Arc<Mutex<MutableMeta>>,
}

impl Message {
    pub(crate) fn assemble(
        id: MessageId,
        path: MessagePath,
        body: Value,
        fixed: FixedMeta,
        mutable: MutableMeta,
    ) -> Self {
        Self {
            id,
            path,
            body: Arc::new(body),
            fixed: Arc::new(fixed),
            mutable: Arc::new(Mutex::new(mutable)),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn path(&self) -> &MessagePath {
        &self.path
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The frozen metadata half.
    pub fn fixed(&self) -> &FixedMeta {
        &self.fixed
    }

    /// Shared handle to the frozen half; used by tests asserting that
    /// operations never replace it.
    pub fn fixed_arc(&self) -> Arc<FixedMeta> {
        Arc::clone(&self.fixed)
    }

    pub fn message_type(&self) -> MessageType {
        self.fixed.message_type
    }

    pub fn trace_id(&self) -> TraceId {
        self.fixed.trace_id
    }

    pub fn flags(&self) -> MessageFlags {
        self.fixed.flags
    }

    /// A point-in-time copy of the mutable half.
    pub fn mutable_snapshot(&self) -> MutableMeta {
        self.mutable.lock().expect("mutable meta poisoned").clone()
    }

    /// Run `f` against the mutable half under its lock.
    pub fn with_mutable<R>(&self, f: impl FnOnce(&mut MutableMeta) -> R) -> R {
        let mut guard = self.mutable.lock().expect("mutable meta poisoned");
        f(&mut guard)
    }

    /// Set a per-hop runtime key on the mutable half.
    pub fn set_runtime_key(&self, key: impl Into<String>, value: Value) {
        self.with_mutable(|m| {
            m.extra.insert(key.into(), value);
        });
    }

    /// Read a per-hop runtime key.
    pub fn runtime_key(&self, key: &str) -> Option<Value> {
        self.with_mutable(|m| m.extra.get(key).cloned())
    }

    /// True when the `processImmediately` runtime key is set truthy.
    pub fn wants_immediate(&self) -> bool {
        matches!(
            self.runtime_key("processImmediately"),
            Some(Value::Bool(true))
        )
    }

    pub fn retries(&self) -> u32 {
        self.with_mutable(|m| m.retries)
    }

    /// Increment the retry counter, returning the new value.
    pub fn record_retry(&self) -> u32 {
        self.with_mutable(|m| {
            m.retries += 1;
            m.retries
        })
    }

    pub fn set_query_result(&self, result: Value) {
        self.with_mutable(|m| m.query_result = Some(result));
    }

    /// The correlation id this message replies to, when it is a response.
    ///
    /// Read from the frozen `inReplyTo` custom key, falling back to an
    /// `inReplyTo` field in the body.
    pub fn in_reply_to(&self) -> Option<MessageId> {
        let from_meta = self
            .fixed
            .custom_key("inReplyTo")
            .and_then(Value::as_str)
            .and_then(MessageId::parse);
        from_meta.or_else(|| {
            self.body
                .get("inReplyTo")
                .and_then(Value::as_str)
                .and_then(MessageId::parse)
        })
    }

    /// The frozen `replyTo` custom key, when one was supplied at creation.
    pub fn reply_to(&self) -> Option<String> {
        self.fixed
            .custom_key("replyTo")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parse_basic() {
        let path = MessagePath::parse("canvas://layers/42").unwrap();
        assert_eq!(path.scheme(), "canvas");
        assert_eq!(path.segments(), &["layers", "42"]);
        assert_eq!(path.route(), "layers/42");
        assert_eq!(path.as_str(), "canvas://layers/42");
    }

    #[test]
    fn path_parse_strips_trailing_slash() {
        let path = MessagePath::parse("svc://do/").unwrap();
        assert_eq!(path.as_str(), "svc://do");
        assert_eq!(path.segments(), &["do"]);
    }

    #[test]
    fn path_parse_rejects_missing_scheme_separator() {
        assert!(MessagePath::parse("no-scheme/path").is_err());
    }

    #[test]
    fn path_parse_rejects_empty_segment() {
        assert!(MessagePath::parse("a://x//y").is_err());
    }

    #[test]
    fn path_parse_rejects_empty_scheme() {
        assert!(MessagePath::parse("://x").is_err());
    }

    #[test]
    fn path_serde_round_trip() {
        let path = MessagePath::parse("kernel://system/status").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"kernel://system/status\"");
        let back: MessagePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn runtime_keys_are_shared_across_clones() {
        let factory = crate::factory::MessageFactory::new();
        let msg = factory
            .create_simple("a://x", Value::Null, Default::default())
            .unwrap();
        let clone = msg.clone();
        clone.set_runtime_key("replyPath", Value::String("b://y".into()));
        assert_eq!(
            msg.runtime_key("replyPath"),
            Some(Value::String("b://y".into()))
        );
    }

    #[test]
    fn fixed_meta_is_shared_not_copied() {
        let factory = crate::factory::MessageFactory::new();
        let msg = factory
            .create_simple("a://x", Value::Null, Default::default())
            .unwrap();
        let clone = msg.clone();
        clone.record_retry();
        clone.set_runtime_key("k", Value::Bool(true));
        assert!(Arc::ptr_eq(&msg.fixed_arc(), &clone.fixed_arc()));
    }
}
