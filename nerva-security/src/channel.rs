use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use nerva_core::{KernelError, MessagePath, Pkr};

/// A routed multi-party endpoint owned by one principal.
#[derive(Clone, Debug, Serialize)]
pub struct Channel {
    /// The full route, e.g. `canvas://channel/layout`. Unique.
    pub route: String,
    pub owner: Pkr,
    pub participants: HashSet<Pkr>,
    pub metadata: Value,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Channel {
    /// A caller may use the channel iff it owns it or participates.
    pub fn can_use(&self, caller: Pkr) -> bool {
        caller == self.owner || self.participants.contains(&caller)
    }

    /// The `name` metadata key, used by the second lookup step.
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(Value::as_str)
    }
}

/// Registry of channels, keyed by exact route.
///
/// Lookup precedence for [`lookup`](Self::lookup): exact route first, then
/// `metadata.name` among the caller's own channels, then the
/// `/channel/<short>` route suffix among the caller's own channels.
#[derive(Default)]
pub struct ChannelRegistry {
    by_route: DashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. The route must be a valid message path; a
    /// conflict on the exact route is an error.
    pub fn create(
        &self,
        owner: Pkr,
        route: &str,
        participants: Vec<Pkr>,
        metadata: Value,
    ) -> Result<Channel, KernelError> {
        let parsed = MessagePath::parse(route)?;
        let route = parsed.as_str().to_string();
        if self.by_route.contains_key(&route) {
            return Err(KernelError::validation(format!(
                "channel route '{}' already exists",
                route
            )));
        }
        let channel = Channel {
            route: route.clone(),
            owner,
            participants: participants.into_iter().collect(),
            metadata,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.by_route.insert(route, channel.clone());
        tracing::debug!(route = %channel.route, owner = %owner, "channel created");
        Ok(channel)
    }

    /// Close a channel; only its owner may.
    pub fn close(&self, caller: Pkr, route: &str) -> Result<(), KernelError> {
        let Some(channel) = self.by_route.get(route).map(|c| c.clone()) else {
            return Err(KernelError::not_found(format!(
                "no channel at route '{}'",
                route
            )));
        };
        if channel.owner != caller {
            return Err(KernelError::forbidden(format!(
                "only the owner may close channel '{}'",
                route
            )));
        }
        self.by_route.remove(route);
        Ok(())
    }

    /// The channel registered at exactly this route, if any.
    pub fn get(&self, route: &str) -> Option<Channel> {
        self.by_route.get(route).map(|c| c.clone())
    }

    /// Three-step lookup; the last two steps search only channels the
    /// caller owns.
    pub fn lookup(&self, caller: Pkr, needle: &str) -> Option<Channel> {
        if let Some(channel) = self.get(needle) {
            return Some(channel);
        }
        let owned = self.owned_by(caller);
        if let Some(channel) = owned.iter().find(|c| c.name() == Some(needle)) {
            return Some(channel.clone());
        }
        let suffix = format!("/channel/{}", needle);
        owned.into_iter().find(|c| c.route.ends_with(&suffix))
    }

    pub fn owned_by(&self, owner: Pkr) -> Vec<Channel> {
        self.by_route
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Drop every channel owned by `owner` (owner dispose cascade).
    pub fn remove_owned_by(&self, owner: Pkr) -> usize {
        let routes: Vec<String> = self
            .by_route
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.route.clone())
            .collect();
        for route in &routes {
            self.by_route.remove(route);
        }
        routes.len()
    }

    pub fn len(&self) -> usize {
        self.by_route.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_route.is_empty()
    }
}
