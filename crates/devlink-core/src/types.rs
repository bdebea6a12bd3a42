/*!
 * Core data types for devlink.
 *
 * This module defines the small value types shared by every devlink crate.
 */
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for devlink resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

/// A string with a fixed maximum length of `N` bytes.
///
/// Storage grows as needed; only the length is bounded. Use [`try_new`]
/// when oversize input is an error and [`truncating`] when it should be cut.
///
/// [`try_new`]: BoundedString::try_new
/// [`truncating`]: BoundedString::truncating
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct BoundedString<const N: usize>(String);

impl<const N: usize> BoundedString<N> {
    /// Maximum length in bytes
    pub const CAPACITY: usize = N;

    /// Create a bounded string, rejecting input longer than `N` bytes
    pub fn try_new<S: Into<String>>(s: S) -> Result<Self> {
        let s = s.into();
        if s.len() > N {
            return Err(Error::validation(format!(
                "string of {} bytes exceeds capacity {}",
                s.len(),
                N
            )));
        }
        Ok(Self(s))
    }

    /// Create a bounded string, cutting the input at the last character
    /// boundary that fits. The flag is `true` when anything was dropped.
    pub fn truncating(s: &str) -> (Self, bool) {
        if s.len() <= N {
            return (Self(s.to_string()), false);
        }
        let mut end = N;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        (Self(s[..end].to_string()), true)
    }

    /// Get the string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remaining capacity in bytes
    pub fn remaining(&self) -> usize {
        N - self.0.len()
    }

    /// Append a string if it fits, leaving `self` untouched otherwise
    pub fn try_push_str(&mut self, s: &str) -> Result<()> {
        if s.len() > self.remaining() {
            return Err(Error::validation(format!(
                "appending {} bytes exceeds capacity {}",
                s.len(),
                N
            )));
        }
        self.0.push_str(s);
        Ok(())
    }

    /// Consume into the inner `String`
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl<const N: usize> Deref for BoundedString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const N: usize> TryFrom<&str> for BoundedString<N> {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::try_new(s)
    }
}

impl<const N: usize> TryFrom<String> for BoundedString<N> {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::try_new(s)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedString<N> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::try_new(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id = Id::new();
        assert!(!id.as_str().is_empty());

        let id: Id = "port-owner".into();
        assert_eq!(id.as_str(), "port-owner");
        assert_eq!(format!("{}", id), "port-owner");
    }

    #[test]
    fn test_bounded_string_rejects_oversize() {
        assert!(BoundedString::<4>::try_new("abcd").is_ok());
        assert!(matches!(
            BoundedString::<4>::try_new("abcde"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_bounded_string_truncates_on_char_boundary() {
        let (s, cut) = BoundedString::<5>::truncating("abcdé");
        assert!(cut);
        assert_eq!(s.as_str(), "abcd");

        let (s, cut) = BoundedString::<8>::truncating("short");
        assert!(!cut);
        assert_eq!(s.as_str(), "short");
    }

    #[test]
    fn test_bounded_string_push() {
        let mut s = BoundedString::<6>::try_new("abc").unwrap();
        s.try_push_str("de").unwrap();
        assert_eq!(s.remaining(), 1);
        assert!(s.try_push_str("fg").is_err());
        assert_eq!(&*s, "abcde");
    }

    #[test]
    fn test_bounded_string_deserialize_checks_capacity() {
        let ok: BoundedString<3> = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<BoundedString<2>>("\"abc\"").is_err());
    }
}
