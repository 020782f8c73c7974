//! Branded ID newtypes for type safety.
//!
//! Users, connections and access tokens are all keyed by strings. Wrapping
//! each in its own newtype keeps a connection id from being passed where a
//! user id is expected, which matters most in the registry's
//! compare-and-remove path.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of leading characters kept by [`ConnectionId::masked`].
const MASK_VISIBLE_CHARS: usize = 8;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Stable user identifier. Assigned by the account directory, never generated here.
    UserId
}

branded_id! {
    /// Unique identifier for one push-channel connection (random UUID v4).
    ConnectionId
}

branded_id! {
    /// Identifier of an issued access token (UUID v7, time-ordered).
    TokenId
}

impl ConnectionId {
    /// Create a new random connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Display-safe partial form: the first eight characters followed by `...`.
    #[must_use]
    pub fn masked(&self) -> String {
        let visible: String = self.0.chars().take(MASK_VISIBLE_CHARS).collect();
        format!("{visible}...")
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenId {
    /// Create a new token ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}
