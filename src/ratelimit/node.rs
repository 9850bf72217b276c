//! Node identity used as the field name for a node's contribution.

use std::fmt;

/// Stable identifier of one fleet member.
///
/// It must stay constant for the lifetime of the process so that successive
/// overwrites land in the same field of every usage record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Use an explicit identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve the identity for this process.
    ///
    /// Prefers the configured id, then the `HOSTNAME` environment variable,
    /// then a random UUID generated once at startup.
    pub fn resolve(configured: Option<&str>) -> Self {
        if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
            return Self::new(id);
        }

        match std::env::var("HOSTNAME") {
            Ok(host) if !host.trim().is_empty() => Self::new(host.trim()),
            _ => Self::new(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
