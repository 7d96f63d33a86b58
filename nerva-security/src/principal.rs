use serde::{Deserialize, Serialize};
use serde_json::Value;

use nerva_core::Pkr;

/// What a principal stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// The runtime's own identity (one per runtime, owned by the kernel).
    #[serde(rename = "self")]
    Self_,
    /// A resource registered under an owning principal; disposed with it.
    Resource,
    /// An external-facing identity registered through `create_friend`.
    Friend,
    /// The identity a subsystem is wired with at registration.
    Subsystem,
}

impl std::fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PrincipalKind::Self_ => "self",
            PrincipalKind::Resource => "resource",
            PrincipalKind::Friend => "friend",
            PrincipalKind::Subsystem => "subsystem",
        };
        f.write_str(text)
    }
}

/// A registered identity. The `pkr` is an opaque token generated at
/// registration; nothing cryptographic binds it to its holder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Principal {
    pub pkr: Pkr,
    pub kind: PrincipalKind,
    pub name: String,
    /// Free-form metadata (`role`, `endpoint`, `type`, ...).
    pub metadata: Value,
    /// Back-reference to the owning principal; set for resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Pkr>,
    /// The registered instance payload, when this principal wraps one
    /// (resources only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Principal {
    pub(crate) fn new(kind: PrincipalKind, name: impl Into<String>, metadata: Value) -> Self {
        Self {
            pkr: Pkr::generate(),
            kind,
            name: name.into(),
            metadata,
            owner: None,
            instance: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The `role` metadata key, when present.
    pub fn role(&self) -> Option<&str> {
        self.metadata.get("role").and_then(Value::as_str)
    }

    /// The `type` metadata key, when present (used by resource queries).
    pub fn type_name(&self) -> Option<&str> {
        self.metadata.get("type").and_then(Value::as_str)
    }
}
