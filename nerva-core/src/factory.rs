use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::KernelError;
use crate::ids::{MessageId, Pkr, SenderId, TraceId, TransactionId};
use crate::message::{
    FixedMeta, Message, MessageFlags, MessagePath, MessageType, MutableMeta, FIXED_CUSTOM_KEYS,
};

/// Options accepted by [`MessageFactory::create`] and friends.
///
/// Everything is optional; the factory fills in ids, timestamps, and a fresh
/// trace id when none is inherited. Meta keys listed in
/// [`FIXED_CUSTOM_KEYS`](crate::message::FIXED_CUSTOM_KEYS) freeze into the
/// fixed half; any other supplied key lands in the mutable half.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub message_type: Option<MessageType>,
    pub trace_id: Option<TraceId>,
    pub caller: Option<Pkr>,
    pub sender_id: Option<SenderId>,
    pub transaction_id: Option<TransactionId>,
    pub seq: Option<u32>,
    pub max_retries: u32,
    pub meta: BTreeMap<String, Value>,
}

impl CreateOptions {
    /// Inherit the parent's trace id (and caller, when none is set).
    pub fn parent(mut self, parent: &Message) -> Self {
        self.trace_id = Some(parent.trace_id());
        if self.caller.is_none() {
            self.caller = parent.fixed().caller;
        }
        self
    }

    pub fn caller(mut self, caller: Pkr) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn meta_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Freeze a `replyTo` destination into the fixed meta.
    pub fn reply_to(self, path: impl Into<String>) -> Self {
        self.meta_key("replyTo", Value::String(path.into()))
    }

    /// Freeze an `inReplyTo` correlation id into the fixed meta, marking
    /// this message as a response.
    pub fn in_reply_to(self, id: MessageId) -> Self {
        self.meta_key("inReplyTo", Value::String(id.to_string()))
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// One entry of a transaction batch; see
/// [`MessageFactory::create_transaction_batch`].
#[derive(Clone, Debug)]
pub struct MessageSpec {
    pub path: String,
    pub body: Value,
}

impl MessageSpec {
    pub fn new(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
        }
    }
}

/// Stamps ids, timestamps, and trace ids onto new messages.
///
/// The factory is stateless and cheap to clone; subsystems get one through
/// their [`SubsystemContext`](crate::context::SubsystemContext).
#[derive(Clone, Debug, Default)]
pub struct MessageFactory;

impl MessageFactory {
    pub fn new() -> Self {
        Self
    }

    /// Create a message of the type named in `options` (default
    /// [`MessageType::Simple`]).
    ///
    /// Flag derivation: `atomic` sets `is_atomic`; `batch` sets `is_batch`
    /// and clears `is_atomic`; `query` — or a path whose first segment is
    /// `query` — sets `is_query`; `command` sets `is_command` and always
    /// mints a fresh sender id, ignoring any supplied one; `error` sets
    /// `is_error`.
    pub fn create(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        let path = MessagePath::parse(path)?;
        let message_type = options.message_type.unwrap_or_default();
        let query_shaped = path.segments().first().map(String::as_str) == Some("query");

        let mut flags = MessageFlags {
            is_query: message_type == MessageType::Query || query_shaped,
            ..MessageFlags::default()
        };
        let mut sender_id = options.sender_id;
        match message_type {
            MessageType::Atomic => flags.is_atomic = true,
            MessageType::Batch => {
                flags.is_batch = true;
                flags.is_atomic = false;
            }
            MessageType::Command => {
                flags.is_command = true;
                sender_id = Some(SenderId::generate());
            }
            MessageType::Error => flags.is_error = true,
            _ => {}
        }

        let mut custom = BTreeMap::new();
        let mut extra = BTreeMap::new();
        for (key, value) in options.meta {
            if FIXED_CUSTOM_KEYS.contains(&key.as_str()) {
                custom.insert(key, value);
            } else {
                extra.insert(key, value);
            }
        }

        let fixed = FixedMeta {
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_type,
            trace_id: options.trace_id.unwrap_or_else(TraceId::generate),
            max_retries: options.max_retries,
            caller: options.caller,
            sender_id,
            transaction_id: options.transaction_id,
            seq: options.seq,
            flags,
            custom,
        };
        let mutable = MutableMeta {
            retries: 0,
            query_result: None,
            extra,
        };

        Ok(Message::assemble(
            MessageId::generate(),
            path,
            body,
            fixed,
            mutable,
        ))
    }

    pub fn create_simple(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Simple)
    }

    pub fn create_atomic(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Atomic)
    }

    pub fn create_batch(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Batch)
    }

    pub fn create_query(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Query)
    }

    pub fn create_command(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Command)
    }

    pub fn create_error(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Error)
    }

    /// Create a retry-typed message recording its retry budget.
    pub fn create_retry(
        &self,
        path: &str,
        body: Value,
        max_retries: u32,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options.max_retries(max_retries), MessageType::Retry)
    }

    pub fn create_transaction(
        &self,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create_typed(path, body, options, MessageType::Transaction)
    }

    /// Create one message per spec, all sharing a freshly generated
    /// transaction id, with `seq` increasing monotonically from 1.
    pub fn create_transaction_batch(
        &self,
        specs: Vec<MessageSpec>,
        options: CreateOptions,
    ) -> Result<Vec<Message>, KernelError> {
        let transaction_id = TransactionId::generate();
        let trace_id = options.trace_id.unwrap_or_else(TraceId::generate);
        specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let mut opts = options.clone();
                opts.message_type = Some(MessageType::Transaction);
                opts.transaction_id = Some(transaction_id);
                opts.trace_id = Some(trace_id);
                opts.seq = Some(index as u32 + 1);
                self.create(&spec.path, spec.body, opts)
            })
            .collect()
    }

    /// Create a child message inheriting the parent's trace id and caller.
    pub fn derive(
        &self,
        parent: &Message,
        path: &str,
        body: Value,
        options: CreateOptions,
    ) -> Result<Message, KernelError> {
        self.create(path, body, options.parent(parent))
    }

    fn create_typed(
        &self,
        path: &str,
        body: Value,
        mut options: CreateOptions,
        message_type: MessageType,
    ) -> Result<Message, KernelError> {
        options.message_type = Some(message_type);
        self.create(path, body, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory() -> MessageFactory {
        MessageFactory::new()
    }

    #[test]
    fn ids_and_timestamps_are_stamped() {
        let msg = factory()
            .create("a://x", Value::Null, CreateOptions::default())
            .unwrap();
        assert!(msg.fixed().timestamp > 0);
        let other = factory()
            .create("a://x", Value::Null, CreateOptions::default())
            .unwrap();
        assert_ne!(msg.id(), other.id());
    }

    #[test]
    fn fresh_trace_id_when_no_parent() {
        let a = factory()
            .create("a://x", Value::Null, CreateOptions::default())
            .unwrap();
        let b = factory()
            .create("a://x", Value::Null, CreateOptions::default())
            .unwrap();
        assert_ne!(a.trace_id(), b.trace_id());
    }

    #[test]
    fn trace_id_inherited_from_parent() {
        let parent = factory()
            .create("a://x", Value::Null, CreateOptions::default())
            .unwrap();
        let child = factory()
            .derive(&parent, "b://y", Value::Null, CreateOptions::default())
            .unwrap();
        assert_eq!(child.trace_id(), parent.trace_id());
    }

    #[test]
    fn command_mints_fresh_sender_id() {
        let supplied = SenderId::generate();
        let mut options = CreateOptions::default();
        options.sender_id = Some(supplied);
        let msg = factory().create_command("a://do", Value::Null, options).unwrap();
        assert!(msg.flags().is_command);
        let minted = msg.fixed().sender_id.unwrap();
        assert_ne!(minted, supplied);
    }

    #[test]
    fn batch_clears_atomic_flag() {
        let msg = factory()
            .create_batch("a://many", Value::Null, CreateOptions::default())
            .unwrap();
        assert!(msg.flags().is_batch);
        assert!(!msg.flags().is_atomic);
    }

    #[test]
    fn atomic_sets_flag() {
        let msg = factory()
            .create_atomic("a://one", Value::Null, CreateOptions::default())
            .unwrap();
        assert!(msg.flags().is_atomic);
    }

    #[test]
    fn query_shaped_path_marks_is_query() {
        let msg = factory()
            .create("canvas://query/layers", Value::Null, CreateOptions::default())
            .unwrap();
        assert_eq!(msg.message_type(), MessageType::Simple);
        assert!(msg.flags().is_query);
    }

    #[test]
    fn error_type_sets_flag() {
        let msg = factory()
            .create_error("a://oops", json!({"reason": "x"}), CreateOptions::default())
            .unwrap();
        assert!(msg.flags().is_error);
    }

    #[test]
    fn retry_records_budget() {
        let msg = factory()
            .create_retry("a://again", Value::Null, 3, CreateOptions::default())
            .unwrap();
        assert_eq!(msg.message_type(), MessageType::Retry);
        assert_eq!(msg.fixed().max_retries, 3);
        assert_eq!(msg.retries(), 0);
    }

    #[test]
    fn known_meta_keys_freeze_unknown_keys_stay_mutable() {
        let options = CreateOptions::default()
            .meta_key("replyTo", Value::String("client://replies".into()))
            .meta_key("hopCount", json!(0));
        let msg = factory().create("a://x", Value::Null, options).unwrap();
        assert_eq!(msg.reply_to().as_deref(), Some("client://replies"));
        assert!(msg.fixed().custom_key("hopCount").is_none());
        assert_eq!(msg.runtime_key("hopCount"), Some(json!(0)));
    }

    #[test]
    fn transaction_batch_shares_id_with_monotonic_seq() {
        let batch = factory()
            .create_transaction_batch(
                vec![
                    MessageSpec::new("a://x", json!({})),
                    MessageSpec::new("a://y", json!({})),
                    MessageSpec::new("a://z", json!({})),
                ],
                CreateOptions::default(),
            )
            .unwrap();
        assert_eq!(batch.len(), 3);
        let txn = batch[0].fixed().transaction_id.unwrap();
        for (i, msg) in batch.iter().enumerate() {
            assert_eq!(msg.fixed().transaction_id, Some(txn));
            assert_eq!(msg.fixed().seq, Some(i as u32 + 1));
            assert_eq!(msg.message_type(), MessageType::Transaction);
        }
        assert_eq!(batch[0].trace_id(), batch[2].trace_id());
    }

    #[test]
    fn in_reply_to_read_from_meta_then_body() {
        let id = MessageId::generate();
        let via_meta = factory()
            .create("a://r", Value::Null, CreateOptions::default().in_reply_to(id))
            .unwrap();
        assert_eq!(via_meta.in_reply_to(), Some(id));

        let via_body = factory()
            .create(
                "a://r",
                json!({"inReplyTo": id.to_string()}),
                CreateOptions::default(),
            )
            .unwrap();
        assert_eq!(via_body.in_reply_to(), Some(id));
    }

    #[test]
    fn invalid_path_is_a_validation_error() {
        let err = factory()
            .create("nopath", Value::Null, CreateOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }
}
