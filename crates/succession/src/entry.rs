use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SuccessionError};

/// Opaque, caller-supplied name of one daemon instance (e.g. a pod name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SuccessionError::EmptyIdentity);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One ownership claim.
///
/// `sequence` is the ordering key; `timestamp` is informational and may
/// collide or go backwards under clock skew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub owner: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rejects_blank() {
        assert!(matches!(
            Identity::new(""),
            Err(SuccessionError::EmptyIdentity)
        ));
        assert!(matches!(
            Identity::new("  "),
            Err(SuccessionError::EmptyIdentity)
        ));
        assert_eq!(Identity::new("pod-a").unwrap().as_str(), "pod-a");
    }
}
