//! Kernel facade for the Nerva runtime.
//!
//! The kernel is the top-level subsystem that owns access control and the
//! request/response correlator. Every cross-subsystem send goes through
//! [`Kernel::send_protected`], which authorises the caller, optionally
//! registers a pending response, and hands the message to the destination.
//! [`Runtime`] assembles a kernel with the global scheduler into one
//! explicitly owned instance.

pub mod correlator;
pub mod kernel;
mod introspect;
pub mod runtime;

pub use correlator::{
    CorrelatorConfig, PendingResponse, ResponseCorrelator, ResponseMatch,
};
pub use kernel::{Kernel, KernelStats, KernelStatsSnapshot, RegisterOptions, KERNEL_SUBSYSTEM};
pub use runtime::{Runtime, RuntimeConfig};
