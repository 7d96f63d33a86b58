use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::dispatch::DispatchOptions;
use crate::error::KernelError;
use crate::error_store::ErrorStore;
use crate::message::{Message, MessageType};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::router::Router;
use crate::stats::ProcessorStats;

/// Observer notified synchronously around handler execution, in
/// accepted → handler → processed | error order. All methods default to
/// no-ops so listeners implement only what they care about.
pub trait ProcessorListener: Send + Sync {
    fn on_message_accepted(&self, _message: &Message) {}
    fn on_message_processed(&self, _message: &Message, _result: &Value) {}
    fn on_error(&self, _message: &Message, _error: &KernelError) {}
}

/// Acknowledgement returned by [`Processor::accept`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcceptOutcome {
    /// The message ran in the caller's suspension context; here is its
    /// result.
    Processed { result: Value },
    /// The message was queued; the fields report the queue's post-state.
    Enqueued { queue_size: usize, capacity: usize },
}

impl AcceptOutcome {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Turns dequeued messages into routed handler invocations.
///
/// The processor owns no task of its own: the global scheduler drives it
/// through [`process_tick`](Self::process_tick), and callers holding the
/// synchronous capability (or passing `process_immediately`) drive it
/// inline. Handler panics are isolated and surfaced as `handler_error`.
pub struct Processor {
    subsystem: String,
    router: Arc<Router>,
    queue: Arc<MessageQueue>,
    error_store: Arc<ErrorStore>,
    stats: Arc<ProcessorStats>,
    listeners: RwLock<Vec<Arc<dyn ProcessorListener>>>,
    synchronous: bool,
}

impl Processor {
    pub fn new(
        subsystem: impl Into<String>,
        router: Arc<Router>,
        queue: Arc<MessageQueue>,
        error_store: Arc<ErrorStore>,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            router,
            queue,
            error_store,
            stats: Arc::new(ProcessorStats::new()),
            listeners: RwLock::new(Vec::new()),
            synchronous: false,
        }
    }

    /// Make every accepted message process in the caller's context,
    /// bypassing the queue.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    pub fn error_store(&self) -> Arc<ErrorStore> {
        Arc::clone(&self.error_store)
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    pub fn add_listener(&self, listener: Arc<dyn ProcessorListener>) {
        self.listeners
            .write()
            .expect("listeners poisoned")
            .push(listener);
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn ProcessorListener>> {
        self.listeners.read().expect("listeners poisoned").clone()
    }

    /// Entry point for every message handed to the subsystem.
    ///
    /// Runs inline when the subsystem is synchronous or the send asks for
    /// immediate processing; otherwise enqueues and acknowledges with the
    /// queue's post-state. A full queue fails with `queue_full`.
    pub async fn accept(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<AcceptOutcome, KernelError> {
        self.stats.record_accepted();
        for listener in self.listeners_snapshot() {
            listener.on_message_accepted(&message);
        }

        if self.synchronous || options.process_immediately || message.wants_immediate() {
            let result = self.run_pipeline(message, options).await?;
            return Ok(AcceptOutcome::Processed { result });
        }

        match self.queue.enqueue(message, options) {
            Ok(queue_size) => Ok(AcceptOutcome::Enqueued {
                queue_size,
                capacity: self.queue.capacity(),
            }),
            Err(err) => {
                self.stats.record_queue_full();
                Err(err)
            }
        }
    }

    /// Run the routing → handler pipeline right now, bypassing queue and
    /// scheduler.
    pub async fn process_immediately(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<Value, KernelError> {
        self.stats.record_accepted();
        for listener in self.listeners_snapshot() {
            listener.on_message_accepted(&message);
        }
        self.run_pipeline(message, options).await
    }

    /// Process one previously dequeued pair.
    pub async fn process_message(&self, queued: QueuedMessage) -> Result<Value, KernelError> {
        self.run_pipeline(queued.message, queued.options).await
    }

    /// Dequeue and run one message; `None` when the queue is empty.
    pub async fn process_tick(&self) -> Option<Result<Value, KernelError>> {
        let queued = self.queue.select_next_message()?;
        Some(self.process_message(queued).await)
    }

    async fn run_pipeline(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<Value, KernelError> {
        let Some(route) = self.router.match_path(message.path()) else {
            let err = KernelError::not_found(format!(
                "no route on '{}' matches '{}'",
                self.subsystem,
                message.path()
            ));
            self.record_failure(&message, &err);
            return Err(err);
        };

        tracing::debug!(
            subsystem = %self.subsystem,
            path = %message.path(),
            pattern = %route.pattern,
            "dispatching message"
        );

        // Handlers signal failure by returning Err (propagated as-is);
        // panics are the "thrown" path and come back as handler_error with
        // the panic text.
        let start = Instant::now();
        let future = (route.handler)(message.clone(), route.params, options.clone());
        let outcome = match tokio::spawn(future).await {
            Ok(result) => result,
            Err(join_err) => Err(KernelError::handler(panic_text(join_err))),
        };

        match outcome {
            Ok(result) => {
                self.stats.record_processed(start.elapsed());
                if message.flags().is_query {
                    message.set_query_result(result.clone());
                }
                for listener in self.listeners_snapshot() {
                    listener.on_message_processed(&message, &result);
                }
                Ok(result)
            }
            Err(err) => {
                if self.try_requeue_retry(&message, &options) {
                    self.stats.record_error();
                    for listener in self.listeners_snapshot() {
                        listener.on_error(&message, &err);
                    }
                    return Err(err);
                }

                self.record_failure(&message, &err);
                Err(err)
            }
        }
    }

    /// Re-enqueue a failed retry-typed message while budget remains.
    /// Returns whether another attempt was scheduled.
    fn try_requeue_retry(&self, message: &Message, options: &DispatchOptions) -> bool {
        if message.message_type() != MessageType::Retry {
            return false;
        }
        if message.retries() >= message.fixed().max_retries {
            return false;
        }
        let attempt = message.record_retry();
        match self.queue.enqueue(message.clone(), options.clone()) {
            Ok(_) => {
                tracing::debug!(
                    subsystem = %self.subsystem,
                    path = %message.path(),
                    attempt,
                    "retrying failed message"
                );
                true
            }
            Err(_) => false,
        }
    }

    fn record_failure(&self, message: &Message, err: &KernelError) {
        self.stats.record_error();
        self.error_store
            .record(err, &self.subsystem, Some(message.id()));
        for listener in self.listeners_snapshot() {
            listener.on_error(message, err);
        }
        tracing::warn!(
            subsystem = %self.subsystem,
            path = %message.path(),
            error = %err,
            "message processing failed"
        );
    }
}

fn panic_text(join_err: tokio::task::JoinError) -> String {
    if join_err.is_panic() {
        let payload = join_err.into_panic();
        if let Some(text) = payload.downcast_ref::<&str>() {
            format!("handler panicked: {text}")
        } else if let Some(text) = payload.downcast_ref::<String>() {
            format!("handler panicked: {text}")
        } else {
            "handler panicked".to_string()
        }
    } else {
        "handler task was cancelled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::factory::{CreateOptions, MessageFactory};
    use crate::router::{handler, RouteMetadata};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn processor() -> Processor {
        let router = Arc::new(Router::new());
        router
            .register(
                "echo/{word}",
                handler(|_msg, params, _opts| async move {
                    Ok(json!({ "echo": params.get("word").cloned() }))
                }),
                RouteMetadata::default(),
            )
            .unwrap();
        router
            .register(
                "fail",
                handler(|_msg, _params, _opts| async {
                    Err(KernelError::validation("deliberate"))
                }),
                RouteMetadata::default(),
            )
            .unwrap();
        router
            .register(
                "explode",
                handler(|_msg, _params, _opts| async { panic!("kaboom") }),
                RouteMetadata::default(),
            )
            .unwrap();
        Processor::new(
            "test",
            router,
            Arc::new(MessageQueue::new(4)),
            Arc::new(ErrorStore::default()),
        )
    }

    fn msg(path: &str) -> Message {
        MessageFactory::new()
            .create(path, Value::Null, CreateOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn accept_enqueues_by_default() {
        let p = processor();
        let outcome = p
            .accept(msg("test://echo/hi"), DispatchOptions::default())
            .await
            .unwrap();
        match outcome {
            AcceptOutcome::Enqueued {
                queue_size,
                capacity,
            } => {
                assert_eq!(queue_size, 1);
                assert_eq!(capacity, 4);
            }
            other => panic!("expected Enqueued, got {other:?}"),
        }
        assert_eq!(p.stats().accepted(), 1);
        assert_eq!(p.stats().processed(), 0);
    }

    #[tokio::test]
    async fn accept_with_immediate_option_runs_inline() {
        let p = processor();
        let outcome = p
            .accept(msg("test://echo/now"), DispatchOptions::default().immediate())
            .await
            .unwrap();
        match outcome {
            AcceptOutcome::Processed { result } => assert_eq!(result["echo"], "now"),
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(p.queue().size(), 0);
    }

    #[tokio::test]
    async fn immediate_runtime_key_bypasses_queue() {
        let p = processor();
        let m = msg("test://echo/key");
        m.set_runtime_key("processImmediately", Value::Bool(true));
        let outcome = p.accept(m, DispatchOptions::default()).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Processed { .. }));
    }

    #[tokio::test]
    async fn synchronous_processor_never_queues() {
        let router = Arc::new(Router::new());
        router
            .register(
                "ping",
                handler(|_m, _p, _o| async { Ok(json!("pong")) }),
                RouteMetadata::default(),
            )
            .unwrap();
        let p = Processor::new(
            "sync",
            router,
            Arc::new(MessageQueue::new(4)),
            Arc::new(ErrorStore::default()),
        )
        .synchronous(true);
        let outcome = p
            .accept(msg("sync://ping"), DispatchOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Processed { .. }));
    }

    #[tokio::test]
    async fn process_tick_drains_fifo() {
        let p = processor();
        p.accept(msg("test://echo/a"), DispatchOptions::default())
            .await
            .unwrap();
        p.accept(msg("test://echo/b"), DispatchOptions::default())
            .await
            .unwrap();

        let first = p.process_tick().await.unwrap().unwrap();
        assert_eq!(first["echo"], "a");
        let second = p.process_tick().await.unwrap().unwrap();
        assert_eq!(second["echo"], "b");
        assert!(p.process_tick().await.is_none());
        assert_eq!(p.stats().processed(), 2);
    }

    #[tokio::test]
    async fn query_messages_record_their_result() {
        let p = processor();
        let m = MessageFactory::new()
            .create_query("test://echo/answer", Value::Null, CreateOptions::default())
            .unwrap();
        p.process_immediately(m.clone(), DispatchOptions::default())
            .await
            .unwrap();
        let snapshot = m.mutable_snapshot();
        assert_eq!(snapshot.query_result.unwrap()["echo"], "answer");
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let p = processor();
        let err = p
            .process_immediately(msg("test://nowhere"), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(p.stats().errors(), 1);
        assert_eq!(p.error_store().len(), 1);
    }

    #[tokio::test]
    async fn handler_error_propagates_unwrapped() {
        let p = processor();
        let err = p
            .process_immediately(msg("test://fail"), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(p.stats().errors(), 1);
        assert_eq!(p.error_store().len(), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_caught() {
        let p = processor();
        let err = p
            .process_immediately(msg("test://explode"), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerError);
        assert!(err.message().contains("kaboom"));
        // Processor still works after a panic.
        let ok = p
            .process_immediately(msg("test://echo/alive"), DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(ok["echo"], "alive");
    }

    #[tokio::test]
    async fn queue_full_records_stat() {
        let router = Arc::new(Router::new());
        router
            .register(
                "x",
                handler(|_m, _p, _o| async { Ok(Value::Null) }),
                RouteMetadata::default(),
            )
            .unwrap();
        let p = Processor::new(
            "tiny",
            router,
            Arc::new(MessageQueue::new(1)),
            Arc::new(ErrorStore::default()),
        );
        p.accept(msg("tiny://x"), DispatchOptions::default())
            .await
            .unwrap();
        let err = p
            .accept(msg("tiny://x"), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(p.stats().snapshot().queue_full, 1);
    }

    #[tokio::test]
    async fn listener_order_is_accepted_then_processed() {
        struct Recorder(Mutex<Vec<&'static str>>);
        impl ProcessorListener for Recorder {
            fn on_message_accepted(&self, _m: &Message) {
                self.0.lock().unwrap().push("accepted");
            }
            fn on_message_processed(&self, _m: &Message, _r: &Value) {
                self.0.lock().unwrap().push("processed");
            }
            fn on_error(&self, _m: &Message, _e: &KernelError) {
                self.0.lock().unwrap().push("error");
            }
        }

        let p = processor();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        p.add_listener(recorder.clone());

        p.process_immediately(msg("test://echo/x"), DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["accepted", "processed"]);

        recorder.0.lock().unwrap().clear();
        let _ = p
            .process_immediately(msg("test://fail"), DispatchOptions::default())
            .await;
        assert_eq!(*recorder.0.lock().unwrap(), vec!["accepted", "error"]);
    }

    #[tokio::test]
    async fn retry_messages_are_requeued_until_budget_exhausted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let router = Arc::new(Router::new());
        let seen = attempts.clone();
        router
            .register(
                "flaky",
                handler(move |_m, _p, _o| {
                    let seen = seen.clone();
                    async move {
                        let n = seen.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(KernelError::internal("transient"))
                        } else {
                            Ok(json!("finally"))
                        }
                    }
                }),
                RouteMetadata::default(),
            )
            .unwrap();
        let p = Processor::new(
            "retrying",
            router,
            Arc::new(MessageQueue::new(8)),
            Arc::new(ErrorStore::default()),
        );

        let m = MessageFactory::new()
            .create_retry("retrying://flaky", Value::Null, 5, CreateOptions::default())
            .unwrap();
        p.accept(m, DispatchOptions::default()).await.unwrap();

        // Attempt 1 fails and requeues; attempt 2 fails and requeues;
        // attempt 3 succeeds.
        assert!(p.process_tick().await.unwrap().is_err());
        assert!(p.process_tick().await.unwrap().is_err());
        let ok = p.process_tick().await.unwrap().unwrap();
        assert_eq!(ok, json!("finally"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Final success recorded; transient failures never hit the store.
        assert_eq!(p.error_store().len(), 0);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_records_the_error() {
        let router = Arc::new(Router::new());
        router
            .register(
                "always-bad",
                handler(|_m, _p, _o| async { Err(KernelError::internal("permanent")) }),
                RouteMetadata::default(),
            )
            .unwrap();
        let p = Processor::new(
            "retrying",
            router,
            Arc::new(MessageQueue::new(8)),
            Arc::new(ErrorStore::default()),
        );

        let m = MessageFactory::new()
            .create_retry(
                "retrying://always-bad",
                Value::Null,
                1,
                CreateOptions::default(),
            )
            .unwrap();
        p.accept(m, DispatchOptions::default()).await.unwrap();

        assert!(p.process_tick().await.unwrap().is_err()); // attempt 1, requeued
        assert!(p.process_tick().await.unwrap().is_err()); // attempt 2, budget spent
        assert!(p.process_tick().await.is_none());
        assert_eq!(p.error_store().len(), 1);
    }
}
