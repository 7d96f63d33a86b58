use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::{Map, Value};

use nerva_core::{KernelError, Pkr};

use crate::channel::{Channel, ChannelRegistry};
use crate::principal::{Principal, PrincipalKind};
use crate::profile::{PermissionProfile, ProfileRegistry};
use crate::rights::{GrantKind, Rights, RightsSnapshot};

/// Options for [`AccessControl::create_friend`].
#[derive(Clone, Debug, Default)]
pub struct FriendOptions {
    pub role: Option<String>,
    pub endpoint: Option<String>,
    pub metadata: Value,
}

/// Options for [`AccessControl::wire_subsystem`].
#[derive(Clone, Debug, Default)]
pub struct WireOptions {
    pub role: Option<String>,
    pub metadata: Value,
}

/// One rights snapshot per level of the owner chain, outermost (the target
/// itself) first.
#[derive(Clone, Debug, serde::Serialize)]
pub struct InheritedRights {
    pub scope: String,
    pub rights: RightsSnapshot,
}

/// The access-control kernel: principals, their rights-with-scope sets,
/// channels, and permission profiles.
///
/// Rights queries here are the single source of truth for authorisation —
/// every protected send and every introspection handler reduces to
/// `can_read` / `can_write` / `can_grant` against a target's set. Mutating
/// a set requires `can_grant` on that same set.
pub struct AccessControl {
    principals: DashMap<Pkr, Principal>,
    rights: DashMap<Pkr, Rights>,
    resource_names: DashMap<String, Pkr>,
    channels: ChannelRegistry,
    profiles: ProfileRegistry,
}

impl AccessControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            principals: DashMap::new(),
            rights: DashMap::new(),
            resource_names: DashMap::new(),
            channels: ChannelRegistry::new(),
            profiles: ProfileRegistry::new(),
        })
    }

    fn insert(&self, principal: Principal, rights: Rights) -> Principal {
        self.rights.insert(principal.pkr, rights);
        self.principals.insert(principal.pkr, principal.clone());
        principal
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register the runtime's own identity.
    pub fn create_self(&self, name: &str, metadata: Value) -> Principal {
        let principal = Principal::new(PrincipalKind::Self_, name, metadata);
        let rights = Rights::new(principal.pkr);
        tracing::debug!(pkr = %principal.pkr, name, "self principal registered");
        self.insert(principal, rights)
    }

    /// Register an external-facing principal.
    pub fn create_friend(&self, name: &str, options: FriendOptions) -> Principal {
        let mut metadata = match options.metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        if let Some(role) = options.role {
            metadata.insert("role".into(), Value::String(role));
        }
        if let Some(endpoint) = options.endpoint {
            metadata.insert("endpoint".into(), Value::String(endpoint));
        }

        let principal = Principal::new(PrincipalKind::Friend, name, Value::Object(metadata));
        let rights = Rights::new(principal.pkr);
        tracing::debug!(pkr = %principal.pkr, name, "friend registered");
        self.insert(principal, rights)
    }

    /// Register a resource under an owner. The resource's rights set is
    /// seeded with the owner as reader, writer, and granter, and the
    /// resource keeps a back-reference for the dispose cascade.
    pub fn create_resource(
        &self,
        owner: Pkr,
        name: &str,
        instance: Option<Value>,
        metadata: Value,
    ) -> Result<Principal, KernelError> {
        if !self.principals.contains_key(&owner) {
            return Err(KernelError::not_found(format!(
                "owner principal '{}' is not registered",
                owner
            )));
        }
        if self.resource_names.contains_key(name) {
            return Err(KernelError::validation(format!(
                "resource '{}' already exists",
                name
            )));
        }

        let mut principal = Principal::new(PrincipalKind::Resource, name, metadata);
        principal.owner = Some(owner);
        principal.instance = instance;
        let rights = Rights::seeded(owner);
        self.resource_names.insert(name.to_string(), principal.pkr);
        tracing::debug!(pkr = %principal.pkr, name, owner = %owner, "resource registered");
        Ok(self.insert(principal, rights))
    }

    /// Create and attach the identity a subsystem acts under. The
    /// subsystem owns its own rights set.
    pub fn wire_subsystem(
        self: &Arc<Self>,
        name: &str,
        options: WireOptions,
    ) -> Result<SubsystemIdentity, KernelError> {
        let taken = self
            .principals
            .iter()
            .any(|p| p.kind == PrincipalKind::Subsystem && p.name == name);
        if taken {
            return Err(KernelError::validation(format!(
                "subsystem '{}' is already wired",
                name
            )));
        }

        let mut metadata = match options.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(role) = options.role {
            metadata.insert("role".into(), Value::String(role));
        }

        let principal = Principal::new(PrincipalKind::Subsystem, name, Value::Object(metadata));
        let rights = Rights::new(principal.pkr);
        let principal = self.insert(principal, rights);
        tracing::debug!(pkr = %principal.pkr, name, "subsystem wired");
        Ok(SubsystemIdentity {
            pkr: principal.pkr,
            name: name.to_string(),
            access: Arc::downgrade(self),
        })
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn principal(&self, pkr: Pkr) -> Option<Principal> {
        self.principals.get(&pkr).map(|p| p.clone())
    }

    pub fn principal_exists(&self, pkr: Pkr) -> bool {
        self.principals.contains_key(&pkr)
    }

    pub fn friends(&self) -> Vec<Principal> {
        self.of_kind(PrincipalKind::Friend)
    }

    pub fn subsystem_principals(&self) -> Vec<Principal> {
        self.of_kind(PrincipalKind::Subsystem)
    }

    fn of_kind(&self, kind: PrincipalKind) -> Vec<Principal> {
        let mut found: Vec<Principal> = self
            .principals
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn resource_by_name(&self, name: &str) -> Option<Principal> {
        let pkr = *self.resource_names.get(name)?;
        self.principal(pkr)
    }

    pub fn resources_by_owner(&self, owner: Pkr) -> Vec<Principal> {
        let mut found: Vec<Principal> = self
            .principals
            .iter()
            .filter(|p| p.kind == PrincipalKind::Resource && p.owner == Some(owner))
            .map(|p| p.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn resources_by_type(&self, type_name: &str) -> Vec<Principal> {
        let mut found: Vec<Principal> = self
            .principals
            .iter()
            .filter(|p| p.kind == PrincipalKind::Resource && p.type_name() == Some(type_name))
            .map(|p| p.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Update a principal's metadata. Allowed for the principal itself and
    /// for granters on its rights set.
    pub fn update_metadata(
        &self,
        caller: Pkr,
        target: Pkr,
        metadata: Value,
    ) -> Result<(), KernelError> {
        if caller != target && !self.can_grant(target, caller) {
            return Err(KernelError::forbidden(
                "metadata updates require grant rights on the target",
            ));
        }
        let mut principal = self
            .principals
            .get_mut(&target)
            .ok_or_else(|| KernelError::not_found(format!("no principal '{}'", target)))?;
        principal.metadata = metadata;
        Ok(())
    }

    // ── Rights ──────────────────────────────────────────────────────────

    pub fn can_read(&self, target: Pkr, caller: Pkr) -> bool {
        self.rights
            .get(&target)
            .map(|r| r.can_read(caller))
            .unwrap_or(false)
    }

    pub fn can_write(&self, target: Pkr, caller: Pkr) -> bool {
        self.rights
            .get(&target)
            .map(|r| r.can_write(caller))
            .unwrap_or(false)
    }

    pub fn can_grant(&self, target: Pkr, caller: Pkr) -> bool {
        self.rights
            .get(&target)
            .map(|r| r.can_grant(caller))
            .unwrap_or(false)
    }

    /// Add `grantee` to one of `target`'s lists. The caller must hold
    /// grant rights on that same set.
    pub fn grant(
        &self,
        caller: Pkr,
        target: Pkr,
        kind: GrantKind,
        grantee: Pkr,
    ) -> Result<(), KernelError> {
        let mut rights = self
            .rights
            .get_mut(&target)
            .ok_or_else(|| KernelError::not_found(format!("no rights set for '{}'", target)))?;
        if !rights.can_grant(caller) {
            return Err(KernelError::forbidden(
                "granting requires membership of the target's granter list",
            ));
        }
        rights.grant(kind, grantee);
        Ok(())
    }

    pub fn revoke(
        &self,
        caller: Pkr,
        target: Pkr,
        kind: GrantKind,
        grantee: Pkr,
    ) -> Result<(), KernelError> {
        let mut rights = self
            .rights
            .get_mut(&target)
            .ok_or_else(|| KernelError::not_found(format!("no rights set for '{}'", target)))?;
        if !rights.can_grant(caller) {
            return Err(KernelError::forbidden(
                "revoking requires membership of the target's granter list",
            ));
        }
        rights.revoke(kind, grantee);
        Ok(())
    }

    pub fn rights_snapshot(&self, target: Pkr) -> Option<RightsSnapshot> {
        self.rights.get(&target).map(|r| r.snapshot())
    }

    /// Snapshots along the owner chain: the target's own set first, then
    /// its owner's, and so on up.
    pub fn inherited_rights(&self, target: Pkr) -> Option<Vec<InheritedRights>> {
        let mut levels = Vec::new();
        let mut current = Some(target);
        while let Some(pkr) = current {
            let principal = self.principal(pkr)?;
            let rights = self.rights_snapshot(pkr)?;
            levels.push(InheritedRights {
                scope: principal.name.clone(),
                rights,
            });
            current = principal.owner;
        }
        Some(levels)
    }

    // ── Profiles ────────────────────────────────────────────────────────

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    /// Apply every grant a profile names to `target`. Returns how many
    /// grants were applied.
    pub fn apply_profile(
        &self,
        caller: Pkr,
        profile_name: &str,
        target: Pkr,
    ) -> Result<usize, KernelError> {
        let profile = self
            .profiles
            .get(profile_name)
            .ok_or_else(|| KernelError::not_found(format!("no profile '{}'", profile_name)))?;
        self.mutate_by_profile(caller, &profile, target, true)
    }

    /// Remove every grant a profile names from `target`.
    pub fn remove_profile(
        &self,
        caller: Pkr,
        profile_name: &str,
        target: Pkr,
    ) -> Result<usize, KernelError> {
        let profile = self
            .profiles
            .get(profile_name)
            .ok_or_else(|| KernelError::not_found(format!("no profile '{}'", profile_name)))?;
        self.mutate_by_profile(caller, &profile, target, false)
    }

    fn mutate_by_profile(
        &self,
        caller: Pkr,
        profile: &PermissionProfile,
        target: Pkr,
        apply: bool,
    ) -> Result<usize, KernelError> {
        let mut rights = self
            .rights
            .get_mut(&target)
            .ok_or_else(|| KernelError::not_found(format!("no rights set for '{}'", target)))?;
        if !rights.can_grant(caller) {
            return Err(KernelError::forbidden(
                "profile application requires grant rights on the target",
            ));
        }
        let mut changed = 0;
        let lists = [
            (GrantKind::Reader, &profile.readers),
            (GrantKind::Writer, &profile.writers),
            (GrantKind::Granter, &profile.granters),
        ];
        for (kind, members) in lists {
            for &pkr in members {
                let did = if apply {
                    rights.grant(kind, pkr)
                } else {
                    rights.revoke(kind, pkr)
                };
                if did {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    // ── Channels & teardown ─────────────────────────────────────────────

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Remove a principal, its rights, its channels, every grant it holds
    /// elsewhere, and (recursively) every principal it owns. Returns the
    /// number of principals removed.
    pub fn dispose_principal(&self, pkr: Pkr) -> usize {
        let Some((_, principal)) = self.principals.remove(&pkr) else {
            return 0;
        };
        let mut removed = 1;
        self.rights.remove(&pkr);
        if principal.kind == PrincipalKind::Resource {
            self.resource_names.remove(&principal.name);
        }
        for mut rights in self.rights.iter_mut() {
            rights.purge(pkr);
        }
        self.channels.remove_owned_by(pkr);

        let owned: Vec<Pkr> = self
            .principals
            .iter()
            .filter(|p| p.owner == Some(pkr))
            .map(|p| p.pkr)
            .collect();
        for orphan in owned {
            removed += self.dispose_principal(orphan);
        }
        tracing::debug!(pkr = %pkr, name = %principal.name, removed, "principal disposed");
        removed
    }

    pub fn principal_count(&self) -> usize {
        self.principals.len()
    }
}

/// The identity handle a subsystem acts under after
/// [`AccessControl::wire_subsystem`]: its pkr plus channel and resource
/// creation scoped to it.
#[derive(Clone)]
pub struct SubsystemIdentity {
    pkr: Pkr,
    name: String,
    access: Weak<AccessControl>,
}

impl SubsystemIdentity {
    pub fn pkr(&self) -> Pkr {
        self.pkr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn access(&self) -> Result<Arc<AccessControl>, KernelError> {
        self.access
            .upgrade()
            .ok_or_else(|| KernelError::internal("access control has been dropped"))
    }

    /// Open a channel owned by this identity.
    pub fn create_channel(
        &self,
        route: &str,
        participants: Vec<Pkr>,
        metadata: Value,
    ) -> Result<Channel, KernelError> {
        self.access()?
            .channels()
            .create(self.pkr, route, participants, metadata)
    }

    pub fn close_channel(&self, route: &str) -> Result<(), KernelError> {
        self.access()?.channels().close(self.pkr, route)
    }

    /// Register a resource owned by this identity.
    pub fn create_resource(
        &self,
        name: &str,
        instance: Option<Value>,
        metadata: Value,
    ) -> Result<Principal, KernelError> {
        self.access()?
            .create_resource(self.pkr, name, instance, metadata)
    }
}

impl std::fmt::Debug for SubsystemIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemIdentity")
            .field("name", &self.name)
            .field("pkr", &self.pkr)
            .finish()
    }
}
