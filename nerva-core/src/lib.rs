//! Core runtime for the Nerva message kernel.
//!
//! A Nerva runtime hosts named subsystems that exchange typed messages over
//! `scheme://path` routes. This crate holds the pieces every subsystem is
//! made of: the message data model and factory, the router, the bounded
//! per-subsystem queue, the processor pipeline, the facet/hook composition
//! engine, and the subsystem lifecycle. The global scheduler, access
//! control, and the kernel facade live in their own crates on top of this
//! one.

pub mod context;
pub mod dispatch;
pub mod error;
pub mod error_store;
pub mod facet;
pub mod factory;
pub mod hooks;
pub mod ids;
pub mod message;
pub mod prelude;
pub mod processor;
pub mod queue;
pub mod router;
pub mod stats;
pub mod subsystem;

pub use context::SubsystemContext;
pub use dispatch::{DispatchOptions, ResponseRequired};
pub use error::{ErrorKind, KernelError, SendResult};
pub use error_store::{ErrorQuery, ErrorRecord, ErrorSeverity, ErrorStore};
pub use facet::{Contract, FacetEntry, FacetObject, FacetParts, FacetSet};
pub use factory::{CreateOptions, MessageFactory, MessageSpec};
pub use hooks::{BuildContext, GraphCache, Hook};
pub use ids::{MessageId, Pkr, SenderId, TraceId, TransactionId};
pub use message::{FixedMeta, Message, MessageFlags, MessagePath, MessageType, MutableMeta};
pub use processor::{AcceptOutcome, Processor, ProcessorListener};
pub use queue::{MessageQueue, QueuedMessage};
pub use router::{
    handler, Handler, HandlerResult, PathParams, RouteInfo, RouteKind, RouteMetadata, Router,
};
pub use stats::{ProcessorStats, StatsSnapshot};
pub use subsystem::{kinds, LifecycleState, Subsystem, SubsystemBuilder, SynchronousMarker};
