// SPDX-License-Identifier: MIT OR Apache-2.0
//! Newtype identifiers with a single source of truth for the permitted
//! character set (spec §4.3 Validator, step 5).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An identifier failed shape validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("identifier {value:?} contains characters outside the permitted set (alnum, ':', '-', '_', '.', '/')")]
pub struct IdentifierError {
    /// The rejected value.
    pub value: String,
}

fn is_permitted_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '/'))
}

macro_rules! identifier_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and construct a new identifier.
            ///
            /// # Errors
            ///
            /// Returns [`IdentifierError`] if `value` is empty or contains
            /// characters outside the permitted set.
            pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
                let value = value.into();
                if is_permitted_identifier(&value) {
                    Ok(Self(value))
                } else {
                    Err(IdentifierError { value })
                }
            }

            /// Borrow the underlying string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

identifier_newtype!(ReceiptId, "A stable external identifier, unique per tenant.");
identifier_newtype!(ObligationId, "A stable identifier grouping a receipt chain.");
identifier_newtype!(TaskId, "A reference to an external execution record.");
identifier_newtype!(PrincipalId, "A principal identifier (emitter, recipient, or escalation target).");
