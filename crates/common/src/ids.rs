//! Identifiers shared between the scheduler, the sweeper and the CLI.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifier of a scheduled job document.
pub type JobId = String;

/// Identifier of a cluster node. Lock documents record the node that holds them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve the local node id: the explicit value when given, otherwise the hostname.
    pub fn resolve(explicit: Option<&str>) -> Result<Self> {
        if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(Self::new(id));
        }
        let host = hostname::get().map_err(|e| Error::node_id(e.to_string()))?;
        let host = host
            .into_string()
            .map_err(|_| Error::node_id("hostname is not valid UTF-8"))?;
        if host.is_empty() {
            return Err(Error::node_id("hostname is empty"));
        }
        Ok(Self(host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
