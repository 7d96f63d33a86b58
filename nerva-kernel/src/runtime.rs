use std::sync::Arc;

use nerva_core::{
    DispatchOptions, KernelError, Message, MessageFactory, Pkr, SendResult, Subsystem,
    SubsystemContext,
};
use nerva_scheduler::{
    strategy_for, GlobalScheduler, RoundRobin, SchedulerConfig, SchedulerHandle,
};
use nerva_security::SubsystemIdentity;

use crate::kernel::{Kernel, RegisterOptions};

/// Runtime assembly knobs.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    /// Strategy name: `round-robin` (default), `priority`, `load-based`,
    /// or `adaptive`.
    pub strategy: Option<String>,
}

/// The explicit owner of one runtime instance: the kernel facade plus the
/// global scheduler.
///
/// There are no process-wide statics — construct a `Runtime`, register
/// subsystems, and pass it by reference wherever sends originate. Multiple
/// independent runtimes can coexist in one process.
pub struct Runtime {
    kernel: Arc<Kernel>,
    scheduler: Arc<GlobalScheduler>,
}

impl Runtime {
    pub async fn new(config: RuntimeConfig) -> Result<Self, KernelError> {
        let ctx = SubsystemContext::new();
        let kernel = Kernel::new(ctx).await?;
        let strategy = config
            .strategy
            .as_deref()
            .map(|name| {
                strategy_for(name).ok_or_else(|| {
                    KernelError::validation(format!("unknown scheduler strategy '{}'", name))
                })
            })
            .transpose()?
            .unwrap_or_else(|| Box::new(RoundRobin::new()));
        let scheduler = Arc::new(GlobalScheduler::with_strategy(config.scheduler, strategy));
        Ok(Self { kernel, scheduler })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn scheduler(&self) -> &Arc<GlobalScheduler> {
        &self.scheduler
    }

    pub fn context(&self) -> &SubsystemContext {
        self.kernel.context()
    }

    pub fn factory(&self) -> Arc<MessageFactory> {
        self.kernel.factory()
    }

    /// Builder for a subsystem wired to this runtime's context.
    pub fn subsystem_builder(&self, name: impl Into<String>) -> nerva_core::SubsystemBuilder {
        Subsystem::builder(name).context(self.context().clone())
    }

    /// Register with the kernel and enter the scheduler rotation.
    pub async fn register(
        &self,
        subsystem: Arc<Subsystem>,
        options: RegisterOptions,
    ) -> Result<SubsystemIdentity, KernelError> {
        let identity = self
            .kernel
            .register_subsystem(Arc::clone(&subsystem), options)
            .await?;
        self.scheduler.register(subsystem);
        Ok(identity)
    }

    /// Remove from the scheduler and the kernel; disposes the subsystem.
    pub async fn unregister(&self, name: &str) -> bool {
        self.scheduler.unregister(name);
        self.kernel.unregister_subsystem(name).await
    }

    /// Start the cooperative dispatch loop.
    pub fn start(&self) -> SchedulerHandle {
        self.scheduler.start()
    }

    /// Convenience passthrough to [`Kernel::send_protected`].
    pub async fn send(
        &self,
        caller: Pkr,
        message: Message,
        options: DispatchOptions,
    ) -> SendResult {
        self.kernel.send_protected(caller, message, options).await
    }

    /// Stop dispatch, then dispose every subsystem in reverse registration
    /// order and drop their pending responses.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.kernel.shutdown().await;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("kernel", &self.kernel)
            .field("scheduled", &self.scheduler.len())
            .finish()
    }
}
