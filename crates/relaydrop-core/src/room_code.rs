//! Room codes.
//!
//! A room code is the only thing a receiver needs to join, so it is short and
//! typeable: 1 to 16 ASCII letters or digits, compared case-insensitively.

use std::{fmt, str::FromStr};

use crate::{env::Environment, error::TransferError};

/// Maximum room code length.
pub const MAX_ROOM_CODE_LEN: usize = 16;

/// Length of generated codes.
pub const GENERATED_CODE_LEN: usize = 6;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Validated, lowercase room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomCode(String);

impl RoomCode {
    /// Validate and normalize `code`.
    ///
    /// # Errors
    ///
    /// - `TransferError::InvalidRoomCode` if empty, longer than 16 bytes, or
    ///   not ASCII alphanumeric
    pub fn parse(code: &str) -> Result<Self, TransferError> {
        let valid = !code.is_empty()
            && code.len() <= MAX_ROOM_CODE_LEN
            && code.bytes().all(|b| b.is_ascii_alphanumeric());

        if !valid {
            return Err(TransferError::InvalidRoomCode(code.to_string()));
        }

        Ok(Self(code.to_ascii_lowercase()))
    }

    /// Generate a random 6-character base-36 code.
    ///
    /// Uniqueness is enforced by the relay; callers retry on a duplicate.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let mut bytes = [0u8; GENERATED_CODE_LEN];
        env.random_bytes(&mut bytes);

        let code = bytes.iter().map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char).collect();
        Self(code)
    }

    /// Code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Byte key prefix used by persistent stores: `[len][bytes]`.
    #[must_use]
    pub fn key_prefix(&self) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(1 + self.0.len());
        prefix.push(self.0.len() as u8);
        prefix.extend_from_slice(self.0.as_bytes());
        prefix
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RoomCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[derive(Clone)]
    struct CountingEnv;

    impl Environment for CountingEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (i as u8) * 7;
            }
        }
    }

    #[test]
    fn parse_normalizes_case() {
        let code = RoomCode::parse("AbC123").unwrap();
        assert_eq!(code.as_str(), "abc123");
        assert_eq!(code, RoomCode::parse("abc123").unwrap());
    }

    #[test]
    fn parse_rejects_invalid() {
        for bad in ["", "has space", "dash-ed", "ünï", "aaaaaaaaaaaaaaaaa"] {
            assert!(
                matches!(RoomCode::parse(bad), Err(TransferError::InvalidRoomCode(_))),
                "accepted {bad:?}"
            );
        }
        assert!(RoomCode::parse("aaaaaaaaaaaaaaaa").is_ok());
    }

    #[test]
    fn generated_codes_are_valid() {
        let code = RoomCode::generate(&CountingEnv);
        assert_eq!(code.as_str().len(), GENERATED_CODE_LEN);
        assert_eq!(RoomCode::parse(code.as_str()).unwrap(), code);
        insta::assert_snapshot!(code.as_str(), @"07elsz");
    }

    #[test]
    fn key_prefix_is_length_delimited() {
        let code = RoomCode::parse("ab").unwrap();
        assert_eq!(code.key_prefix(), vec![2, b'a', b'b']);
    }
}
