use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::context::SubsystemContext;
use crate::dispatch::DispatchOptions;
use crate::error::KernelError;
use crate::error_store::{ErrorStore, DEFAULT_ERROR_STORE_CAPACITY};
use crate::facet::{Contract, FacetObject, FacetParts, FacetSet};
use crate::hooks::{self, Hook};
use crate::message::Message;
use crate::processor::{AcceptOutcome, Processor};
use crate::queue::{MessageQueue, DEFAULT_QUEUE_CAPACITY};
use crate::router::{Handler, RouteMetadata, Router};
use crate::stats::StatsSnapshot;

/// Well-known facet kinds installed by the default hook set.
pub mod kinds {
    pub const ROUTER: &str = "router";
    pub const QUEUE: &str = "queue";
    pub const ERROR_STORE: &str = "error_store";
    pub const PROCESSOR: &str = "processor";
    pub const SYNCHRONOUS: &str = "synchronous";
    pub const IDENTITY: &str = "identity";
}

/// Marker facet: its presence makes the processor run every accepted
/// message in the caller's context.
pub struct SynchronousMarker;

/// Lifecycle states. Build is monotonic; dispose is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Constructed,
    Building,
    Built,
    Paused,
    Disposed,
}

/// Staged configuration for a [`Subsystem`].
pub struct SubsystemBuilder {
    name: String,
    ctx: Option<SubsystemContext>,
    queue_capacity: usize,
    error_capacity: usize,
    synchronous: bool,
    priority: i32,
    hooks: Vec<Hook>,
}

impl SubsystemBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ctx: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            error_capacity: DEFAULT_ERROR_STORE_CAPACITY,
            synchronous: false,
            priority: 0,
            hooks: Vec::new(),
        }
    }

    pub fn context(mut self, ctx: SubsystemContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Install the synchronous marker: accepted messages bypass the queue.
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Append a custom hook after the defaults.
    pub fn hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Finish staging. The subsystem is `Constructed`; call
    /// [`Subsystem::build`] to run the hook transaction.
    pub fn create(self) -> Arc<Subsystem> {
        let ctx = self.ctx.unwrap_or_default();

        let mut hooks = default_hooks(self.queue_capacity, self.error_capacity);
        if self.synchronous {
            hooks.push(Hook::new(kinds::SYNCHRONOUS, |_ctx| {
                Ok(FacetParts::new(SynchronousMarker))
            }));
        }
        hooks.extend(self.hooks);

        Arc::new(Subsystem {
            name: self.name,
            ctx,
            state: Mutex::new(LifecycleState::Constructed),
            build_lock: tokio::sync::Mutex::new(()),
            pending_hooks: Mutex::new(Some(hooks)),
            facets: RwLock::new(FacetSet::new()),
            api: RwLock::new(HashMap::new()),
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            priority: AtomicI32::new(self.priority),
        })
    }
}

fn default_hooks(queue_capacity: usize, error_capacity: usize) -> Vec<Hook> {
    vec![
        Hook::new(kinds::ROUTER, |_ctx| Ok(FacetParts::new(Router::new())))
            .attach()
            .contract(Contract::of::<Router>("router")),
        Hook::new(kinds::QUEUE, move |_ctx| {
            Ok(FacetParts::new(MessageQueue::new(queue_capacity)))
        })
        .attach()
        .contract(Contract::of::<MessageQueue>("queue")),
        Hook::new(kinds::ERROR_STORE, move |_ctx| {
            Ok(FacetParts::new(ErrorStore::new(error_capacity)))
        })
        .attach(),
        Hook::new(kinds::PROCESSOR, |build: &hooks::BuildContext<'_>| {
            let router = build.facet::<Router>(kinds::ROUTER)?;
            let queue = build.facet::<MessageQueue>(kinds::QUEUE)?;
            let error_store = build.facet::<ErrorStore>(kinds::ERROR_STORE)?;
            let synchronous = build.facets().find(kinds::SYNCHRONOUS).is_some();
            Ok(FacetParts::new(
                Processor::new(build.subsystem(), router, queue, error_store)
                    .synchronous(synchronous),
            ))
        })
        .requires(&[kinds::ROUTER, kinds::QUEUE, kinds::ERROR_STORE])
        .attach()
        .contract(Contract::of::<Processor>("processor")),
    ]
}

/// A named, composable execution unit: a facet set assembled by hooks, a
/// message pipeline, and a place in the parent/child hierarchy.
///
/// Construction is staged: [`Subsystem::builder`] collects hooks, `create`
/// yields a `Constructed` handle, and [`build`](Self::build) runs the hook
/// transaction. Dispatch is delegated to the processor facet; the global
/// scheduler drives queued work through [`process_slice`](Self::process_slice).
pub struct Subsystem {
    name: String,
    ctx: SubsystemContext,
    state: Mutex<LifecycleState>,
    build_lock: tokio::sync::Mutex<()>,
    pending_hooks: Mutex<Option<Vec<Hook>>>,
    facets: RwLock<FacetSet>,
    api: RwLock<HashMap<String, FacetObject>>,
    parent: RwLock<Option<Weak<Subsystem>>>,
    children: RwLock<Vec<Arc<Subsystem>>>,
    priority: AtomicI32,
}

impl Subsystem {
    pub fn builder(name: impl Into<String>) -> SubsystemBuilder {
        SubsystemBuilder::new(name)
    }

    /// Builder for a child subsystem inheriting this subsystem's context.
    pub fn child_builder(&self, name: impl Into<String>) -> SubsystemBuilder {
        SubsystemBuilder::new(name).context(self.ctx.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &SubsystemContext {
        &self.ctx
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("state poisoned")
    }

    fn set_state(&self, next: LifecycleState) {
        *self.state.lock().expect("state poisoned") = next;
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state(), LifecycleState::Built | LifecycleState::Paused)
    }

    pub fn is_paused(&self) -> bool {
        self.state() == LifecycleState::Paused
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Run the hook transaction. Idempotent: concurrent and repeated calls
    /// serialize on one lock, and late callers observe `Built` and return
    /// immediately. A failed build rolls back every facet it added.
    pub async fn build(self: &Arc<Self>) -> Result<(), KernelError> {
        let _guard = self.build_lock.lock().await;
        match self.state() {
            LifecycleState::Built | LifecycleState::Paused => return Ok(()),
            LifecycleState::Disposed => {
                return Err(KernelError::build(format!(
                    "subsystem '{}' is disposed",
                    self.name
                )))
            }
            _ => {}
        }
        self.set_state(LifecycleState::Building);

        let hooks = self
            .pending_hooks
            .lock()
            .expect("hooks poisoned")
            .take()
            .unwrap_or_default();

        match hooks::run_build(&self.name, &self.ctx, hooks, self.ctx.graph_cache()).await {
            Ok((facets, api)) => {
                *self.facets.write().expect("facets poisoned") = facets;
                *self.api.write().expect("api poisoned") = api;
                self.set_state(LifecycleState::Built);
                tracing::info!(subsystem = %self.name, "subsystem built");
                Ok(())
            }
            Err(err) => {
                self.set_state(LifecycleState::Constructed);
                tracing::warn!(subsystem = %self.name, error = %err, "subsystem build failed");
                Err(err)
            }
        }
    }

    /// Suspend dispatch. Messages continue to enqueue; the scheduler skips
    /// this subsystem until [`resume`](Self::resume).
    pub fn pause(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock().expect("state poisoned");
        match *state {
            LifecycleState::Built | LifecycleState::Paused => {
                *state = LifecycleState::Paused;
                Ok(())
            }
            other => Err(KernelError::validation(format!(
                "cannot pause subsystem '{}' in state {:?}",
                self.name, other
            ))),
        }
    }

    pub fn resume(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock().expect("state poisoned");
        match *state {
            LifecycleState::Built | LifecycleState::Paused => {
                *state = LifecycleState::Built;
                Ok(())
            }
            other => Err(KernelError::validation(format!(
                "cannot resume subsystem '{}' in state {:?}",
                self.name, other
            ))),
        }
    }

    /// Tear down: children in reverse registration order, then facets in
    /// reverse install order, then local state. Idempotent and terminal.
    pub fn dispose(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            {
                let mut state = this.state.lock().expect("state poisoned");
                if *state == LifecycleState::Disposed {
                    return;
                }
                *state = LifecycleState::Disposed;
            }

            let children: Vec<Arc<Subsystem>> = {
                let mut children = this.children.write().expect("children poisoned");
                children.drain(..).collect()
            };
            for child in children.into_iter().rev() {
                child.dispose().await;
            }

            this.facets.write().expect("facets poisoned").dispose_all();
            this.api.write().expect("api poisoned").clear();
            tracing::info!(subsystem = %this.name, "subsystem disposed");
        })
    }

    // ── Hierarchy ───────────────────────────────────────────────────────

    pub fn add_child(self: &Arc<Self>, child: Arc<Subsystem>) {
        *child.parent.write().expect("parent poisoned") = Some(Arc::downgrade(self));
        self.children
            .write()
            .expect("children poisoned")
            .push(child);
    }

    pub fn parent(&self) -> Option<Arc<Subsystem>> {
        self.parent
            .read()
            .expect("parent poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    pub fn root(self: &Arc<Self>) -> Arc<Subsystem> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn children(&self) -> Vec<Arc<Subsystem>> {
        self.children.read().expect("children poisoned").clone()
    }

    // ── Facet access ────────────────────────────────────────────────────

    /// Latest-installed facet object of `kind`.
    pub fn find_facet(&self, kind: &str) -> Option<FacetObject> {
        self.facets
            .read()
            .expect("facets poisoned")
            .find(kind)
            .map(|entry| entry.object())
    }

    /// Typed facet accessor.
    pub fn facet<T: Send + Sync + 'static>(&self, kind: &str) -> Option<Arc<T>> {
        self.facets.read().expect("facets poisoned").get::<T>(kind)
    }

    pub fn facet_kinds(&self) -> Vec<String> {
        self.facets.read().expect("facets poisoned").kinds()
    }

    /// Typed lookup on the attached api surface.
    pub fn api_get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.api
            .read()
            .expect("api poisoned")
            .get(name)
            .cloned()
            .and_then(|object| object.downcast::<T>().ok())
    }

    /// Expose an externally built object on the api surface (e.g. the
    /// identity handle wired in at kernel registration). Returns `false`
    /// when the name is already taken.
    pub fn attach_api(&self, name: impl Into<String>, object: FacetObject) -> bool {
        let mut api = self.api.write().expect("api poisoned");
        let name = name.into();
        if api.contains_key(&name) {
            return false;
        }
        api.insert(name, object);
        true
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn processor(&self) -> Result<Arc<Processor>, KernelError> {
        self.facet::<Processor>(kinds::PROCESSOR).ok_or_else(|| {
            KernelError::internal(format!("subsystem '{}' is not built", self.name))
        })
    }

    /// Convenience access to the router facet.
    pub fn router(&self) -> Option<Arc<Router>> {
        self.facet::<Router>(kinds::ROUTER)
    }

    /// Register a route on this subsystem's router facet.
    pub fn register_route(
        &self,
        pattern: &str,
        handler: Handler,
        metadata: RouteMetadata,
    ) -> Result<(), KernelError> {
        let router = self.router().ok_or_else(|| {
            KernelError::internal(format!("subsystem '{}' is not built", self.name))
        })?;
        router.register(pattern, handler, metadata)
    }

    /// Hand a message to this subsystem (queue or inline, per the
    /// processor's policy).
    pub async fn accept(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<AcceptOutcome, KernelError> {
        self.processor()?.accept(message, options).await
    }

    /// Run the pipeline inline, bypassing queue and scheduler.
    pub async fn process_immediately(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<Value, KernelError> {
        self.processor()?.process_immediately(message, options).await
    }

    /// Dequeue and process one message; `None` when the queue is empty.
    pub async fn process_tick(&self) -> Option<Result<Value, KernelError>> {
        let processor = self.processor().ok()?;
        processor.process_tick().await
    }

    /// Make forward progress for up to `slice` or until the queue drains.
    /// Returns how many messages were processed. Paused subsystems make no
    /// progress (their queues keep filling).
    pub async fn process_slice(&self, slice: Duration) -> usize {
        if self.is_paused() || !self.is_built() {
            return 0;
        }
        let deadline = tokio::time::Instant::now() + slice;
        let mut processed = 0;
        while tokio::time::Instant::now() < deadline {
            match self.process_tick().await {
                Some(_) => {
                    processed += 1;
                    tokio::task::yield_now().await;
                }
                None => break,
            }
        }
        processed
    }

    pub fn queue_size(&self) -> usize {
        self.facet::<MessageQueue>(kinds::QUEUE)
            .map(|queue| queue.size())
            .unwrap_or(0)
    }

    pub fn stats_snapshot(&self) -> Option<StatsSnapshot> {
        self.facet::<Processor>(kinds::PROCESSOR)
            .map(|p| p.stats().snapshot())
    }

    pub fn error_store(&self) -> Option<Arc<ErrorStore>> {
        self.facet::<ErrorStore>(kinds::ERROR_STORE)
    }
}

impl std::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystem")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}
