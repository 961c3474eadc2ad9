//! Identifier types for fleetscale.
//!
//! Server names double as hostnames on most providers, so they are restricted
//! to lowercase DNS label characters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix applied to every generated server name.
pub const NAME_PREFIX: &str = "agent-";

/// Number of random characters appended to [`NAME_PREFIX`].
const NAME_SUFFIX_LEN: usize = 8;

/// Maximum length of a DNS label.
const MAX_NAME_LEN: usize = 63;

/// The unique, stable name of a managed server.
///
/// Chosen by the planner when the server is first recorded and kept for the
/// whole lifetime of the machine.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName(String);

impl ServerName {
    /// Generate a new random server name of the form `agent-xxxxxxxx`.
    #[must_use]
    pub fn generate() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{NAME_PREFIX}{}", &suffix[..NAME_SUFFIX_LEN]))
    }

    /// Parse and validate a server name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, too long, or contains characters
    /// outside `[a-z0-9-]`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_NAME_LEN {
            return Err(IdError::InvalidLength {
                expected: MAX_NAME_LEN,
                got: s.len(),
            });
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(IdError::InvalidCharacter(c));
        }
        Ok(Self(s.to_string()))
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the raw bytes of the name.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerName({})", self.0)
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerName> for String {
    fn from(name: ServerName) -> Self {
        name.0
    }
}

impl AsRef<str> for ServerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generate a fresh per-machine secret.
///
/// The secret is 32 random bytes (blake3 over two v4 UUIDs), hex-encoded.
#[must_use]
pub fn generate_secret() -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string is empty.
    #[error("identifier is empty")]
    Empty,

    /// The input has an incorrect length.
    #[error("invalid length: at most {expected} characters, got {got}")]
    InvalidLength {
        /// The maximum number of characters.
        expected: usize,
        /// The actual number of characters.
        got: usize,
    },

    /// The input contains a character that is not allowed.
    #[error("invalid character {0:?}")]
    InvalidCharacter(char),
}
