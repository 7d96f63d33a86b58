//! Re-exports of the types most applications touch.

pub use crate::context::SubsystemContext;
pub use crate::dispatch::{DispatchOptions, ResponseRequired};
pub use crate::error::{ErrorKind, KernelError, SendResult};
pub use crate::factory::{CreateOptions, MessageFactory, MessageSpec};
pub use crate::hooks::Hook;
pub use crate::ids::{MessageId, Pkr, TraceId};
pub use crate::message::{Message, MessagePath, MessageType};
pub use crate::processor::AcceptOutcome;
pub use crate::router::{handler, RouteKind, RouteMetadata};
pub use crate::subsystem::{LifecycleState, Subsystem};
