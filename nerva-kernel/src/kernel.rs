use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use nerva_core::{
    DispatchOptions, KernelError, Message, MessageFactory, Pkr, SendResult, Subsystem,
    SubsystemContext,
};
use nerva_security::{AccessControl, SubsystemIdentity, WireOptions};

use crate::correlator::{CorrelatorConfig, ResponseCorrelator, ResponseMatch};
use crate::introspect;

/// Options for [`Kernel::register_subsystem`].
#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    /// Require senders to hold write rights on this subsystem's identity.
    pub protected: bool,
    pub role: Option<String>,
    pub metadata: Value,
}

impl RegisterOptions {
    pub fn protected() -> Self {
        Self {
            protected: true,
            ..Self::default()
        }
    }
}

/// Monotonic kernel-level counters.
#[derive(Debug, Default)]
pub struct KernelStats {
    sent: AtomicU64,
    delivered: AtomicU64,
    denied: AtomicU64,
    responses_matched: AtomicU64,
    timeouts_emitted: AtomicU64,
    dropped: AtomicU64,
}

/// Serializable view of [`KernelStats`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct KernelStatsSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub denied: u64,
    pub responses_matched: u64,
    pub timeouts_emitted: u64,
    pub dropped: u64,
}

impl KernelStats {
    pub fn snapshot(&self) -> KernelStatsSnapshot {
        KernelStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            timeouts_emitted: self.timeouts_emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The kernel facade: the top-level subsystem that owns access control and
/// the response correlator, and gates every cross-subsystem send.
///
/// All failures come back as [`SendResult`] data — nothing is thrown across
/// the kernel boundary. The kernel also registers the `kernel://`
/// introspection routes on its own (synchronous) subsystem.
pub struct Kernel {
    ctx: SubsystemContext,
    access: Arc<AccessControl>,
    correlator: Arc<ResponseCorrelator>,
    subsystems: Arc<DashMap<String, Arc<Subsystem>>>,
    identities: Arc<DashMap<String, SubsystemIdentity>>,
    protected: DashMap<String, ()>,
    registration_order: Mutex<Vec<String>>,
    identity: SubsystemIdentity,
    stats: Arc<KernelStats>,
    started_at: i64,
    timeout_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    drain_running: AtomicBool,
}

/// The reserved name of the kernel's own subsystem.
pub const KERNEL_SUBSYSTEM: &str = "kernel";

impl Kernel {
    /// Assemble a kernel: access control, correlator, and the `kernel://`
    /// subsystem with its introspection routes.
    pub async fn new(ctx: SubsystemContext) -> Result<Arc<Self>, KernelError> {
        let access = AccessControl::new();
        let (correlator, timeout_rx) =
            ResponseCorrelator::new(ctx.factory(), CorrelatorConfig::default());

        let kernel_subsystem = Subsystem::builder(KERNEL_SUBSYSTEM)
            .context(ctx.clone())
            .synchronous()
            .create();
        kernel_subsystem.build().await?;

        let identity = access.wire_subsystem(KERNEL_SUBSYSTEM, WireOptions::default())?;
        kernel_subsystem.attach_api(
            nerva_core::kinds::IDENTITY,
            Arc::new(identity.clone()) as nerva_core::FacetObject,
        );

        let subsystems: Arc<DashMap<String, Arc<Subsystem>>> = Arc::new(DashMap::new());
        let identities: Arc<DashMap<String, SubsystemIdentity>> = Arc::new(DashMap::new());
        let stats = Arc::new(KernelStats::default());
        let started_at = chrono::Utc::now().timestamp_millis();

        introspect::register_routes(
            &kernel_subsystem,
            introspect::Deps {
                access: Arc::clone(&access),
                subsystems: Arc::clone(&subsystems),
                correlator: Arc::clone(&correlator),
                stats: Arc::clone(&stats),
                started_at,
            },
        )?;

        subsystems.insert(KERNEL_SUBSYSTEM.to_string(), Arc::clone(&kernel_subsystem));
        identities.insert(KERNEL_SUBSYSTEM.to_string(), identity.clone());

        let kernel = Arc::new(Self {
            ctx,
            access,
            correlator,
            subsystems,
            identities,
            protected: DashMap::new(),
            registration_order: Mutex::new(vec![KERNEL_SUBSYSTEM.to_string()]),
            identity,
            stats,
            started_at,
            timeout_rx: Mutex::new(Some(timeout_rx)),
            drain_running: AtomicBool::new(false),
        });
        kernel.start_timeout_drain();
        Ok(kernel)
    }

    /// Spawn the task that delivers synthetic timeout responses. Runs
    /// once; the task holds only a weak kernel reference so shutdown is
    /// not kept alive by it.
    fn start_timeout_drain(self: &Arc<Self>) {
        if self.drain_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.timeout_rx.lock().expect("timeout rx poisoned").take() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(kernel) = weak.upgrade() else {
                    break;
                };
                kernel.deliver_timeout(message).await;
            }
        });
    }

    pub fn context(&self) -> &SubsystemContext {
        &self.ctx
    }

    pub fn factory(&self) -> Arc<MessageFactory> {
        self.ctx.factory()
    }

    pub fn access(&self) -> &Arc<AccessControl> {
        &self.access
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    /// The kernel's own principal.
    pub fn identity(&self) -> &SubsystemIdentity {
        &self.identity
    }

    pub fn stats(&self) -> KernelStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    // ── Subsystem registry ──────────────────────────────────────────────

    /// Register a subsystem: build it if needed, wire its identity
    /// principal, and attach the identity handle to its api.
    pub async fn register_subsystem(
        &self,
        subsystem: Arc<Subsystem>,
        options: RegisterOptions,
    ) -> Result<SubsystemIdentity, KernelError> {
        let name = subsystem.name().to_string();
        if self.subsystems.contains_key(&name) {
            return Err(KernelError::validation(format!(
                "subsystem '{}' is already registered",
                name
            )));
        }
        subsystem.build().await?;

        let identity = self.access.wire_subsystem(
            &name,
            WireOptions {
                role: options.role,
                metadata: options.metadata,
            },
        )?;
        subsystem.attach_api(
            nerva_core::kinds::IDENTITY,
            Arc::new(identity.clone()) as nerva_core::FacetObject,
        );
        if options.protected {
            self.protected.insert(name.clone(), ());
        }

        self.subsystems.insert(name.clone(), subsystem);
        self.identities.insert(name.clone(), identity.clone());
        self.registration_order
            .lock()
            .expect("registration order poisoned")
            .push(name.clone());
        tracing::info!(subsystem = %name, protected = options.protected, "subsystem registered");
        Ok(identity)
    }

    /// Remove and dispose a subsystem, its principal, and its pending
    /// responses.
    pub async fn unregister_subsystem(&self, name: &str) -> bool {
        if name == KERNEL_SUBSYSTEM {
            return false;
        }
        let Some((_, subsystem)) = self.subsystems.remove(name) else {
            return false;
        };
        self.registration_order
            .lock()
            .expect("registration order poisoned")
            .retain(|n| n != name);
        self.protected.remove(name);
        subsystem.dispose().await;
        if let Some((_, identity)) = self.identities.remove(name) {
            self.correlator.cancel_for_owner(identity.pkr());
            self.access.dispose_principal(identity.pkr());
        }
        tracing::info!(subsystem = %name, "subsystem unregistered");
        true
    }

    pub fn subsystem(&self, name: &str) -> Option<Arc<Subsystem>> {
        self.subsystems.get(name).map(|s| Arc::clone(&s))
    }

    pub fn subsystem_identity(&self, name: &str) -> Option<SubsystemIdentity> {
        self.identities.get(name).map(|i| i.clone())
    }

    /// Registered names, in registration order.
    pub fn subsystem_names(&self) -> Vec<String> {
        self.registration_order
            .lock()
            .expect("registration order poisoned")
            .clone()
    }

    // ── Protected send ──────────────────────────────────────────────────

    /// The kernel send contract: authorise, correlate, deliver. Errors are
    /// returned in the envelope, never thrown.
    pub async fn send_protected(
        &self,
        caller: Pkr,
        message: Message,
        options: DispatchOptions,
    ) -> SendResult {
        KernelStats::bump(&self.stats.sent);

        if !self.access.principal_exists(caller) {
            KernelStats::bump(&self.stats.denied);
            return SendResult::failure(KernelError::forbidden(format!(
                "caller '{}' is not a registered principal",
                caller
            )));
        }

        // Responses route through the correlator; the destination comes
        // from the pending entry, not the message.
        if options.is_response {
            return match self.correlator.handle_response(&message, None) {
                ResponseMatch::Matched(pending) => {
                    KernelStats::bump(&self.stats.responses_matched);
                    self.deliver(&pending.reply_to, message, options, caller).await
                }
                ResponseMatch::Unmatched { reason } => {
                    KernelStats::bump(&self.stats.dropped);
                    SendResult::failure(KernelError::not_found(reason))
                }
            };
        }

        let scheme = message.path().scheme().to_string();
        let Some(destination) = self.subsystem(&scheme) else {
            return SendResult::failure(KernelError::not_found(format!(
                "unknown subsystem '{}'",
                scheme
            )));
        };

        // Channel routes are gated on membership before anything else
        // touches the destination.
        if let Some(channel) = self.access.channels().get(message.path().as_str()) {
            if !channel.can_use(caller) {
                KernelStats::bump(&self.stats.denied);
                return SendResult::failure(KernelError::forbidden(format!(
                    "caller may not use channel '{}'",
                    channel.route
                )));
            }
        }

        // Write-protected destinations require a grant on the
        // subsystem's identity.
        if self.protected.contains_key(&scheme) {
            let allowed = self
                .identities
                .get(&scheme)
                .map(|identity| {
                    let pkr = identity.pkr();
                    caller == pkr || self.access.can_write(pkr, caller)
                })
                .unwrap_or(false);
            if !allowed {
                KernelStats::bump(&self.stats.denied);
                return SendResult::failure(KernelError::forbidden(format!(
                    "caller lacks write rights on subsystem '{}'",
                    scheme
                )));
            }
        }

        if let Some(response_required) = &options.response_required {
            if let Err(err) = self
                .correlator
                .register(caller, &message, response_required)
            {
                return SendResult::failure(err);
            }
        }

        let mut delivery = options.clone();
        delivery.caller_id = Some(caller);
        match destination.accept(message, delivery).await {
            Ok(outcome) => {
                KernelStats::bump(&self.stats.delivered);
                SendResult::ok(outcome.to_value())
            }
            Err(err) => SendResult::failure(err),
        }
    }

    /// Deliver a matched response to the subsystem named by the pending
    /// entry's reply path.
    async fn deliver(
        &self,
        reply_to: &str,
        message: Message,
        options: DispatchOptions,
        caller: Pkr,
    ) -> SendResult {
        let scheme = match nerva_core::MessagePath::parse(reply_to) {
            Ok(path) => path.scheme().to_string(),
            Err(err) => return SendResult::failure(err),
        };
        let Some(destination) = self.subsystem(&scheme) else {
            KernelStats::bump(&self.stats.dropped);
            return SendResult::failure(KernelError::not_found(format!(
                "reply destination '{}' is not registered",
                scheme
            )));
        };
        let mut delivery = options.clone();
        delivery.caller_id = Some(caller);
        delivery.is_response = false;
        match destination.accept(message, delivery).await {
            Ok(outcome) => {
                KernelStats::bump(&self.stats.delivered);
                SendResult::ok(outcome.to_value())
            }
            Err(err) => SendResult::failure(err),
        }
    }

    /// Synthetic timeout responses enter here from the correlator's
    /// channel; the kernel itself is the sender, so no further
    /// authorisation applies.
    async fn deliver_timeout(&self, message: Message) {
        KernelStats::bump(&self.stats.timeouts_emitted);
        let scheme = message.path().scheme().to_string();
        let Some(destination) = self.subsystem(&scheme) else {
            KernelStats::bump(&self.stats.dropped);
            tracing::warn!(path = %message.path(), "timeout response has no destination");
            return;
        };
        let options = DispatchOptions::caller(self.identity.pkr());
        if let Err(err) = destination.accept(message, options).await {
            tracing::warn!(error = %err, "timeout response could not be delivered");
        }
    }

    /// Dispose every registered subsystem in reverse registration order,
    /// cancel their pending responses, and finally dispose the kernel's
    /// own subsystem.
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let order = self
                .registration_order
                .lock()
                .expect("registration order poisoned");
            order.iter().rev().cloned().collect()
        };
        for name in names {
            if name == KERNEL_SUBSYSTEM {
                continue;
            }
            self.unregister_subsystem(&name).await;
        }
        self.correlator.cancel_all();
        if let Some(kernel_sub) = self.subsystem(KERNEL_SUBSYSTEM) {
            kernel_sub.dispose().await;
        }
        tracing::info!("kernel shut down");
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("subsystems", &self.subsystems.len())
            .field("pending_responses", &self.correlator.pending_count())
            .finish()
    }
}
