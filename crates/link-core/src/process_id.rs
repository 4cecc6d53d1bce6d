//! ProcessId: Identifier of a participant in the distributed system.
//!
//! Opaque and comparable. Deployments typically number their processes
//! (`"0"`, `"1"`, ...) but any non-empty token without whitespace is valid.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessIdError {
    #[error("Process ID must not be empty")]
    Empty,
    #[error("Process ID must not contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Identifier of a process, stable for the process's lifetime.
///
/// # Examples
/// ```
/// use link_core::ProcessId;
///
/// let pid: ProcessId = "1".parse().unwrap();
/// assert_eq!(pid.as_str(), "1");
/// assert!("".parse::<ProcessId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(String);

impl ProcessId {
    /// Build a process ID, validating the token.
    pub fn new(id: impl Into<String>) -> Result<Self, ProcessIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProcessIdError::Empty);
        }
        if id.chars().any(char::is_whitespace) {
            return Err(ProcessIdError::Whitespace(id));
        }
        Ok(Self(id))
    }

    /// Get the underlying token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProcessId {
    type Err = ProcessIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ProcessId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Serialize as a plain string so frames stay readable on the wire
impl serde::Serialize for ProcessId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ProcessId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric() {
        let pid: ProcessId = "0".parse().unwrap();
        assert_eq!(pid.as_str(), "0");
        assert_eq!(pid.to_string(), "0");
    }

    #[test]
    fn test_parse_name() {
        let pid: ProcessId = "node-a".parse().unwrap();
        assert_eq!(pid.as_str(), "node-a");
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!("".parse::<ProcessId>(), Err(ProcessIdError::Empty));
    }

    #[test]
    fn test_reject_whitespace() {
        assert!("a b".parse::<ProcessId>().is_err());
        assert!(" a".parse::<ProcessId>().is_err());
        assert!("a\n".parse::<ProcessId>().is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a: ProcessId = "a".parse().unwrap();
        let b: ProcessId = "b".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_as_plain_string() {
        let pid: ProcessId = "7".parse().unwrap();
        let json = serde_json::to_string(&pid).unwrap();
        assert_eq!(json, "\"7\"");
        let parsed: ProcessId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pid);
    }

    #[test]
    fn test_serde_rejects_empty() {
        assert!(serde_json::from_str::<ProcessId>("\"\"").is_err());
    }
}
