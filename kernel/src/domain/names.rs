//! Validated identifiers for projects and branches.
//!
//! Names end up in filesystem paths, container names and SQL rows, so they are
//! restricted to a conservative alphabet.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_NAME_LEN: usize = 63;

/// Errors produced when validating a name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name was empty.
    #[error("{kind} name must not be empty")]
    Empty {
        /// What was being named.
        kind: &'static str,
    },
    /// The name exceeded the length limit.
    #[error("{kind} name '{name}' is longer than 63 characters")]
    TooLong {
        /// What was being named.
        kind: &'static str,
        /// The rejected name.
        name: String,
    },
    /// The name contained a character outside `[A-Za-z0-9_-]` or started with `-`.
    #[error("{kind} name '{name}' may only contain letters, digits, '_' and '-', and must not start with '-'")]
    InvalidCharacter {
        /// What was being named.
        kind: &'static str,
        /// The rejected name.
        name: String,
    },
}

fn validate(kind: &'static str, name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            kind,
            name: name.to_string(),
        });
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !name.starts_with('-');
    if !valid {
        return Err(NameError::InvalidCharacter {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

macro_rules! name_type {
    ($(#[$meta:meta])* $ty:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $ty(String);

        impl $ty {
            /// Validates and wraps a name.
            ///
            /// # Errors
            ///
            /// Returns a [`NameError`] if the name is empty, too long or
            /// contains characters outside `[A-Za-z0-9_-]`.
            pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
                let name = name.into();
                validate($kind, &name)?;
                Ok(Self(name))
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $ty {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }
    };
}

name_type!(
    /// Name of a project; unique across the store.
    ProjectName,
    "project"
);

name_type!(
    /// Name of a branch; unique within its project and used as its id.
    BranchName,
    "branch"
);

impl BranchName {
    /// The root branch every project starts with.
    pub const MAIN: &'static str = "main";

    /// Returns the `main` branch name.
    #[must_use]
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    /// Whether this is the root `main` branch.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(ProjectName::new("p1").is_ok());
        assert!(BranchName::new("feature_login-2").is_ok());
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(matches!(
            BranchName::new("../etc"),
            Err(NameError::InvalidCharacter { .. })
        ));
        assert!(matches!(
            ProjectName::new("a/b"),
            Err(NameError::InvalidCharacter { .. })
        ));
        assert!(matches!(
            BranchName::new("-rf"),
            Err(NameError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn rejects_empty_and_long_names() {
        assert!(matches!(ProjectName::new(""), Err(NameError::Empty { .. })));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            BranchName::new(long),
            Err(NameError::TooLong { .. })
        ));
    }

    #[test]
    fn main_branch_is_recognised() {
        assert!(BranchName::main().is_main());
        assert!(!BranchName::new("b1").unwrap().is_main());
    }

    #[test]
    fn deserialization_validates() {
        let ok: Result<BranchName, _> = serde_json::from_str("\"b1\"");
        assert!(ok.is_ok());
        let bad: Result<BranchName, _> = serde_json::from_str("\"b 1\"");
        assert!(bad.is_err());
    }
}
