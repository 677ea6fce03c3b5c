use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of characters of a session id used in narrative file names.
pub const SHORT_PREFIX_LEN: usize = 8;

/// Session identifier supplied by the agent. Never generated locally.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename-safe short prefix of the id.
    pub fn short(&self) -> String {
        let prefix: String = self
            .0
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(SHORT_PREFIX_LEN)
            .collect();
        if prefix.is_empty() {
            "session".to_string()
        } else {
            prefix
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

branded_id!(FailureId, "fail");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_prefix_takes_first_eight_alphanumerics() {
        let id = SessionId::from_raw("abc12345-6789-aaaa-bbbb-cccccccccccc");
        assert_eq!(id.short(), "abc12345");
    }

    #[test]
    fn short_prefix_skips_unsafe_chars() {
        let id = SessionId::from_raw("a/b\\c:d_e");
        assert_eq!(id.short(), "abcde");
    }

    #[test]
    fn short_prefix_of_short_id() {
        assert_eq!(SessionId::from_raw("abc").short(), "abc");
        assert_eq!(SessionId::from_raw("---").short(), "session");
    }

    #[test]
    fn failure_id_has_prefix() {
        let id = FailureId::new();
        assert!(id.as_str().starts_with("fail_"), "got: {id}");
    }

    #[test]
    fn failure_ids_are_unique() {
        assert_ne!(FailureId::new(), FailureId::new());
    }

    #[test]
    fn session_id_serializes_transparently() {
        let id = SessionId::from_raw("abc12345");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc12345\"");
    }
}
