//! Redacting wrapper for generated passwords, private keys and wrapping tokens.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A string that never shows up in `Debug`, `Display` or serialized output.
///
/// The only way to read the value is [`SecretString::expose_secret`]. The
/// buffer is zeroed on drop. Deserialization accepts the real value, so a
/// credential can be received over the plugin boundary and wrapped again.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the underlying value. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let password = SecretString::new("A1a-hunter2hunter2hunter2");
        assert_eq!(format!("{:?}", password), "SecretString([REDACTED])");
        assert_eq!(format!("{}", password), "[REDACTED]");
        assert_eq!(serde_json::to_string(&password).unwrap(), "\"[REDACTED]\"");
        assert_eq!(password.expose_secret(), "A1a-hunter2hunter2hunter2");
        assert_eq!(password.len(), 25);
    }

    #[test]
    fn test_secret_deserializes_real_value() {
        let secret: SecretString = serde_json::from_str("\"token-value\"").unwrap();
        assert_eq!(secret.expose_secret(), "token-value");
        assert_eq!(secret, SecretString::from("token-value"));
        assert!(!secret.is_empty());
    }
}
