//! Tenant identities (sanitized phone numbers) and JID helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum number of digits accepted for an identity.
pub const MIN_IDENTITY_DIGITS: usize = 5;
/// Maximum number of digits accepted for an identity (E.164 limit).
pub const MAX_IDENTITY_DIGITS: usize = 15;

/// Domain suffix used for individual WhatsApp accounts.
pub const USER_JID_SUFFIX: &str = "s.whatsapp.net";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,

    #[error("identity contains invalid character '{0}'")]
    InvalidCharacter(char),

    #[error("identity must have 5-15 digits, got {0}")]
    InvalidLength(usize),
}

/// A tenant key: the digits of the phone number that owns a session.
///
/// Always holds only ASCII digits; construct it with [`Identity::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Sanitize a user-supplied phone number or JID into an identity.
    ///
    /// Accepts forms like `+62 811-1234`, `(62) 8111234`, `628111234@s.whatsapp.net`
    /// and device JIDs such as `628111234:12@s.whatsapp.net`.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        let user = trimmed.split_once('@').map_or(trimmed, |(user, _)| user);
        let user = user.split_once(':').map_or(user, |(user, _)| user);
        let user = user.strip_prefix('+').unwrap_or(user);

        let mut digits = String::with_capacity(user.len());
        for c in user.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                other => return Err(IdentityError::InvalidCharacter(other)),
            }
        }

        if digits.is_empty() {
            return Err(IdentityError::Empty);
        }
        if !(MIN_IDENTITY_DIGITS..=MAX_IDENTITY_DIGITS).contains(&digits.len()) {
            return Err(IdentityError::InvalidLength(digits.len()));
        }

        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The user JID for this number.
    pub fn jid(&self) -> String {
        format!("{}@{}", self.0, USER_JID_SUFFIX)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve a message recipient into a JID.
///
/// Anything already carrying a domain (`...@g.us`, `...@s.whatsapp.net`) is passed
/// through untouched; bare numbers are sanitized and given the user suffix.
pub fn recipient_jid(recipient: &str) -> Result<String, IdentityError> {
    let trimmed = recipient.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }
    Ok(Identity::parse(trimmed)?.jid())
}
