//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings for wire compatibility.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
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

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
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
    };
}

string_newtype!(
    /// Upstream-assigned identifier of a specific binary build, distinct from
    /// the human-readable version string.
    CommitId
);

/// Marketplace extension identifier of the form `publisher.name`.
///
/// Identity is case-insensitive; the canonical form preserves upstream casing
/// and is what appears in directory names and served responses. Use
/// [`normalized`](Self::normalized) for map keys and comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Parse and validate an identifier. The publisher and name segments must
    /// be non-empty and restricted to characters safe for a path component.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let Some((publisher, name)) = s.split_once('.') else {
            return Err(SchemaError::InvalidExtensionId(s.to_owned()));
        };
        let segment_ok = |seg: &str| {
            !seg.is_empty()
                && seg
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
        };
        if !segment_ok(publisher) || !segment_ok(name) || name.contains("..") {
            return Err(SchemaError::InvalidExtensionId(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }

    /// Build an identifier from its two halves.
    pub fn from_parts(publisher: &str, name: &str) -> Result<Self, SchemaError> {
        Self::parse(&format!("{publisher}.{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form used for identity comparison and index keys.
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn publisher(&self) -> &str {
        self.0.split_once('.').map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map(|(_, n)| n).unwrap_or("")
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq for ExtensionId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ExtensionId {}

impl std::hash::Hash for ExtensionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl FromStr for ExtensionId {
    type Err = SchemaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Named release track of the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Stable,
    Insider,
    Exploration,
}

impl Quality {
    pub const ALL: [Quality; 3] = [Quality::Stable, Quality::Insider, Quality::Exploration];

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Stable => "stable",
            Quality::Insider => "insider",
            Quality::Exploration => "exploration",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = SchemaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Quality::Stable),
            "insider" => Ok(Quality::Insider),
            "exploration" => Ok(Quality::Exploration),
            other => Err(SchemaError::UnknownQuality(other.to_owned())),
        }
    }
}

/// Order two version strings, newest last.
///
/// Uses strict semver when both sides parse; falls back to a dotted numeric
/// comparison and finally plain string order, since marketplace versions are
/// not guaranteed to be valid semver.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => {
            let nums = |s: &str| -> Vec<u64> {
                s.split(['.', '-', '+'])
                    .map_while(|part| part.parse::<u64>().ok())
                    .collect()
            };
            let (na, nb) = (nums(a), nums(b));
            if na.is_empty() && nb.is_empty() {
                a.cmp(b)
            } else {
                na.cmp(&nb).then_with(|| a.cmp(b))
            }
        }
    }
}
