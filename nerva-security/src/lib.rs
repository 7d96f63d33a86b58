//! Access control for the Nerva message kernel.
//!
//! Principals (self / friend / resource / subsystem) are opaque identities;
//! each one owns a rights-with-scope set (readers / writers / granters) that
//! every authorisation decision in the runtime reduces to. Channels are
//! routed multi-party endpoints with owner-plus-participants membership;
//! permission profiles are named grant sets applied against a resource's
//! rights.

pub mod channel;
pub mod principal;
pub mod profile;
pub mod registry;
pub mod rights;

pub use channel::{Channel, ChannelRegistry};
pub use principal::{Principal, PrincipalKind};
pub use profile::{PermissionProfile, ProfileRegistry};
pub use registry::{
    AccessControl, FriendOptions, InheritedRights, SubsystemIdentity, WireOptions,
};
pub use rights::{GrantKind, Rights, RightsSnapshot};
