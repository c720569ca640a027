//! Redacting secret wrapper
//!
//! [`Secret<T>`] hides its value from every formatting and serialization path
//! so that structs holding credentials can be logged or marshalled without
//! leaking them. The only way to read the value is [`Secret::reveal`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Placeholder emitted instead of the secret value.
pub const REDACTED: &str = "[REDACTED]";

/// A value that must never appear in logs, errors, or serialized output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    /// Wrap a value
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Access the wrapped value
    pub fn reveal(&self) -> &T {
        &self.0
    }

    /// Unwrap into the inner value
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> Serialize for Secret<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// Secrets are read from config files and request bodies, so they deserialize
/// transparently from the inner type.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Secret<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct Credentials {
        user: String,
        password: Secret<String>,
    }

    const VALUE: &str = "hunter2-very-secret";

    #[test]
    fn every_rendering_is_redacted() {
        let secret = Secret::new(VALUE.to_string());
        let renderings = [
            secret.to_string(),
            format!("{secret:?}"),
            format!("{secret:#?}"),
            serde_json::to_string(&secret).unwrap(),
            serde_yaml::to_string(&secret).unwrap(),
        ];
        for out in renderings {
            assert!(out.contains(REDACTED), "{out}");
            assert!(!out.contains(VALUE), "{out}");
        }
        assert_eq!(secret.reveal(), VALUE);
    }

    #[test]
    fn enclosing_struct_does_not_leak() {
        let creds = Credentials {
            user: "ada".into(),
            password: Secret::new(VALUE.into()),
        };
        let debug = format!("{creds:?}");
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!debug.contains(VALUE));
        assert!(!json.contains(VALUE));
        assert!(json.contains(r#""password":"[REDACTED]""#));
    }

    #[test]
    fn deserializes_from_plain_value() {
        let secret: Secret<String> = serde_json::from_str(r#""s3cr3t""#).unwrap();
        assert_eq!(secret.reveal(), "s3cr3t");
    }
}
