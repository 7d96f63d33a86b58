//! Nerva — an in-process message-driven kernel.
//!
//! This facade crate re-exports the Nerva sub-crates through a single
//! dependency. Import everything you need with:
//!
//! ```ignore
//! use nerva::prelude::*;
//! ```
//!
//! | Module | Crate | Contents |
//! |---|---|---|
//! | `core` | `nerva-core` | messages, routing, queues, facets, subsystems |
//! | `scheduler` | `nerva-scheduler` | cooperative loop + strategies |
//! | `security` | `nerva-security` | principals, rights, channels, profiles |
//! | `kernel` | `nerva-kernel` | protected sends, correlation, runtime |

pub use nerva_core as core;
pub use nerva_kernel as kernel;
pub use nerva_scheduler as scheduler;
pub use nerva_security as security;

// Re-export the core surface at the top level for convenience.
pub use nerva_core::*;

pub use nerva_kernel::{Kernel, RegisterOptions, ResponseCorrelator, Runtime, RuntimeConfig};
pub use nerva_scheduler::{GlobalScheduler, Schedulable, ScheduleStrategy, SchedulerConfig};
pub use nerva_security::{AccessControl, Channel, GrantKind, Principal, SubsystemIdentity};

pub mod prelude {
    //! One-stop imports for applications building on the kernel.

    pub use nerva_core::prelude::*;
    pub use nerva_kernel::{Kernel, RegisterOptions, Runtime, RuntimeConfig};
    pub use nerva_scheduler::{SchedulerConfig, SchedulerHandle};
    pub use nerva_security::{
        AccessControl, FriendOptions, GrantKind, PermissionProfile, Principal, PrincipalKind,
        SubsystemIdentity,
    };
}
