//! Instance identifiers.

use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Length of an instance ID in hex characters (a SHA-1 digest).
pub const INSTANCE_ID_LEN: usize = 40;

/// Returned when a string is not a well-formed instance ID.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid instance ID '{0}': expected 40 lowercase hex characters")]
pub struct InvalidInstanceId(pub String);

/// Content identifier of one built package instance.
///
/// The ID is the lowercase hex SHA-1 of the deterministic archive payload,
/// so it is independent of any signatures appended after the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Parse and validate an instance ID.
    ///
    /// Uppercase hex is rejected rather than normalized: the ID doubles as a
    /// directory name and must have exactly one spelling.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidInstanceId`] unless `s` is exactly 40 characters of
    /// `[0-9a-f]`.
    pub fn new(s: &str) -> Result<Self, InvalidInstanceId> {
        if is_valid_instance_id(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidInstanceId(s.to_string()))
        }
    }

    /// Compute the instance ID of an archive payload.
    pub fn compute(payload: &[u8]) -> Self {
        Self(hex::encode(Sha1::digest(payload)))
    }

    /// Return the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns `true` if `s` is exactly 40 lowercase hex characters.
pub fn is_valid_instance_id(s: &str) -> bool {
    s.len() == INSTANCE_ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for InstanceId {
    type Err = InvalidInstanceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
