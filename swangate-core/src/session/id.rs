//! Session and transaction identifiers, and session tokens.
//!
//! Ids are small integers addressed into fixed-capacity slot tables; the
//! token is the secret that proves a caller owns a session id.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

macro_rules! define_id_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Create a new ID from a u32 value
            pub fn new(id: u32) -> Self {
                Self(id)
            }

            /// Get the underlying u32 ID
            pub fn id(&self) -> u32 {
                self.0
            }

            /// Index of the slot this ID lives in for a table of `capacity` slots
            pub fn slot(&self, capacity: usize) -> usize {
                self.0 as usize % capacity
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }
    };
}

define_id_type!(SessionId, "Session ID - wraps a u32 slot-addressed ID");
define_id_type!(TransactionId, "Transaction ID - wraps a u32 slot-addressed ID");

/// Secret issued to the caller that opened a session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Create a new random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Byte-for-byte comparison that does not short-circuit on the first difference.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_map_onto_slots_modulo_capacity() {
        assert_eq!(SessionId::new(1).slot(65_536), 1);
        assert_eq!(SessionId::new(65_536).slot(65_536), 0);
        assert_eq!(SessionId::new(65_537).slot(65_536), 1);
        assert_eq!(TransactionId::new(u32::MAX).slot(65_536), 65_535);
        assert_eq!(TransactionId::from(9).slot(4), 1);
    }

    #[test]
    fn ids_serialize_as_plain_numbers() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&SessionId::new(42))?, "42");
        let parsed: TransactionId = serde_json::from_str("7")?;
        assert_eq!(parsed.id(), 7);
        assert_eq!(parsed.to_string(), "7");
        Ok(())
    }

    #[test]
    fn generated_tokens_are_uuid_text_and_distinct() {
        let first = SessionToken::generate();
        let second = SessionToken::generate();
        assert_eq!(first.as_str().len(), 36);
        assert!(Uuid::parse_str(first.as_str()).is_ok());
        assert_ne!(first, second);
    }

    #[test]
    fn token_match_rejects_any_difference() {
        let token = SessionToken::generate();
        let exact = token.as_str().to_string();
        assert!(token.matches(&exact));

        let mut one_byte_off = exact.clone().into_bytes();
        let last = one_byte_off.len() - 1;
        one_byte_off[last] = if one_byte_off[last] == b'0' { b'1' } else { b'0' };
        let one_byte_off = String::from_utf8(one_byte_off).unwrap_or_default();
        assert!(!token.matches(&one_byte_off));

        assert!(!token.matches(&exact[..exact.len() - 1]));
        assert!(!token.matches(&format!("{exact}0")));
        assert!(!token.matches(""));
    }

    #[test]
    fn token_debug_output_is_redacted() {
        let token = SessionToken::generate();
        assert!(!format!("{token:?}").contains(token.as_str()));
    }
}
