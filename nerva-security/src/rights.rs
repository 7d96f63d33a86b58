use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use nerva_core::Pkr;

/// The three grant lists of a rights-with-scope set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Reader,
    Writer,
    Granter,
}

/// Rights-With-Scope: the reader/writer/granter triad held by a
/// principal's identity.
///
/// The owner is an implicit member of all three lists for its own set;
/// explicit membership is tracked per grantee pkr. Authorisation decisions
/// everywhere in the kernel reduce to [`can_read`](Self::can_read) /
/// [`can_write`](Self::can_write) / [`can_grant`](Self::can_grant) on the
/// target's set.
#[derive(Clone, Debug)]
pub struct Rights {
    owner: Pkr,
    readers: HashSet<Pkr>,
    writers: HashSet<Pkr>,
    granters: HashSet<Pkr>,
}

impl Rights {
    pub fn new(owner: Pkr) -> Self {
        Self {
            owner,
            readers: HashSet::new(),
            writers: HashSet::new(),
            granters: HashSet::new(),
        }
    }

    /// A set whose owner is also an explicit member of every list, the
    /// seeding used for resources.
    pub fn seeded(owner: Pkr) -> Self {
        let mut rights = Self::new(owner);
        rights.readers.insert(owner);
        rights.writers.insert(owner);
        rights.granters.insert(owner);
        rights
    }

    pub fn owner(&self) -> Pkr {
        self.owner
    }

    pub fn can_read(&self, caller: Pkr) -> bool {
        caller == self.owner || self.readers.contains(&caller)
    }

    pub fn can_write(&self, caller: Pkr) -> bool {
        caller == self.owner || self.writers.contains(&caller)
    }

    pub fn can_grant(&self, caller: Pkr) -> bool {
        caller == self.owner || self.granters.contains(&caller)
    }

    fn list_mut(&mut self, kind: GrantKind) -> &mut HashSet<Pkr> {
        match kind {
            GrantKind::Reader => &mut self.readers,
            GrantKind::Writer => &mut self.writers,
            GrantKind::Granter => &mut self.granters,
        }
    }

    /// Add `grantee` to a list. Returns whether the set changed.
    /// Authorisation is the caller's job (see `AccessControl::grant`).
    pub fn grant(&mut self, kind: GrantKind, grantee: Pkr) -> bool {
        self.list_mut(kind).insert(grantee)
    }

    /// Remove `grantee` from a list. Returns whether the set changed.
    pub fn revoke(&mut self, kind: GrantKind, grantee: Pkr) -> bool {
        self.list_mut(kind).remove(&grantee)
    }

    /// Drop every grant held by `pkr` (used when a principal is disposed).
    pub fn purge(&mut self, pkr: Pkr) {
        self.readers.remove(&pkr);
        self.writers.remove(&pkr);
        self.granters.remove(&pkr);
    }

    pub fn snapshot(&self) -> RightsSnapshot {
        let sorted = |set: &HashSet<Pkr>| {
            let mut list: Vec<Pkr> = set.iter().copied().collect();
            list.sort();
            list
        };
        RightsSnapshot {
            owner: self.owner,
            readers: sorted(&self.readers),
            writers: sorted(&self.writers),
            granters: sorted(&self.granters),
        }
    }
}

/// Serializable point-in-time view of a [`Rights`] set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RightsSnapshot {
    pub owner: Pkr,
    pub readers: Vec<Pkr>,
    pub writers: Vec<Pkr>,
    pub granters: Vec<Pkr>,
}
