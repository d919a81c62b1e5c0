// Core identifier types shared across all decksync crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum byte length accepted for a shard id.
pub const MAX_SHARD_ID_LEN: usize = 128;

/// Separator used inside composite CRDT keys; rejected in element ids.
pub(crate) const KEY_SEPARATOR: char = '\u{1f}';

/// A named partition of the deck (typically one page or a small group of
/// pages). Used as the room key on the relay and the load unit on clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardIdError {
    #[error("shard id must not be empty")]
    Empty,
    #[error("shard id exceeds {max} bytes (got {len})")]
    TooLong { len: usize, max: usize },
    #[error("shard id contains invalid character {0:?}")]
    InvalidChar(char),
}

impl ShardId {
    /// Validate and wrap a shard id. Allowed: ASCII alphanumerics and `-_.:`.
    pub fn new(value: impl Into<String>) -> Result<Self, ShardIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ShardIdError::Empty);
        }
        if value.len() > MAX_SHARD_ID_LEN {
            return Err(ShardIdError::TooLong { len: value.len(), max: MAX_SHARD_ID_LEN });
        }
        if let Some(bad) = value.chars().find(|ch| !is_shard_id_char(*ch)) {
            return Err(ShardIdError::InvalidChar(bad));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShardId {
    type Err = ShardIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<String> for ShardId {
    type Error = ShardIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ShardId> for String {
    fn from(value: ShardId) -> Self {
        value.0
    }
}

impl AsRef<str> for ShardId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_shard_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':')
}

/// Check that an element or page id can be embedded in composite keys.
pub fn is_valid_element_id(value: &str) -> bool {
    !value.is_empty() && !value.contains(KEY_SEPARATOR)
}
