//! Validated GnuPG recipient identifiers.
//!
//! Every encryption run passes each recipient to the cipher tool as a `-r`
//! argument, so the strings have to be vetted once at configuration time
//! rather than on every flush.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseRecipientError {
    #[error("recipient is empty")]
    Empty,

    #[error("recipient {0:?} has {1} hex digits, expected 8, 16, or 40")]
    BadLength(String, usize),

    #[error("recipient {0:?} contains a non-hexadecimal character")]
    BadCharacter(String),
}

/// A key fingerprint (or short/long key id) accepted by `gpg -r`.
///
/// Canonical form is uppercase hex with no `0x` prefix and no spaces; the
/// canonical rendering is exactly what gets handed to the cipher tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Recipient(String);

impl Recipient {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Recipient {
    type Err = ParseRecipientError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseRecipientError::Empty);
        }

        // gpg prints fingerprints in space-grouped form; accept that too.
        let compact: String = s.chars().filter(|c| *c != ' ').collect();
        let hex = compact
            .strip_prefix("0x")
            .or_else(|| compact.strip_prefix("0X"))
            .unwrap_or(&compact);

        match hex.len() {
            8 | 16 | 40 => {}
            n => return Err(ParseRecipientError::BadLength(s.to_string(), n)),
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseRecipientError::BadCharacter(s.to_string()));
        }

        Ok(Recipient(hex.to_ascii_uppercase()))
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_key_ids_and_fingerprints() {
        for valid in [
            "DEADBEEF",
            "0123456789abcdef",
            "0123456789ABCDEF0123456789ABCDEF01234567",
        ] {
            assert!(valid.parse::<Recipient>().is_ok(), "{valid}");
        }
    }

    #[test]
    fn canonicalizes_case_prefix_and_spacing() {
        let r: Recipient = "0xdeadbeef".parse().unwrap();
        assert_eq!(r.as_str(), "DEADBEEF");

        let r: Recipient = "0123 4567 89AB CDEF 0123 4567 89AB CDEF 0123 4567"
            .parse()
            .unwrap();
        assert_eq!(r.as_str(), "0123456789ABCDEF0123456789ABCDEF01234567");
    }

    #[test]
    fn rejects_empty() {
        assert_eq!("".parse::<Recipient>(), Err(ParseRecipientError::Empty));
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(matches!(
            "ABCDEF".parse::<Recipient>(),
            Err(ParseRecipientError::BadLength(_, 6))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(
            "WXYZWXYZ".parse::<Recipient>(),
            Err(ParseRecipientError::BadCharacter(_))
        ));
    }
}
