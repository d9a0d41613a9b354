//! Macros for defining typed ID types.

/// Maximum length of an operator-chosen name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Validates that `s` is usable as a single coordination-store path segment.
pub(crate) fn validate_name(s: &str) -> Result<(), crate::IdError> {
    if s.is_empty() {
        return Err(crate::IdError::Empty);
    }
    if s.len() > MAX_NAME_LEN {
        return Err(crate::IdError::TooLong {
            len: s.len(),
            max: MAX_NAME_LEN,
        });
    }
    if s == "." || s == ".." {
        return Err(crate::IdError::Reserved(s.to_string()));
    }
    if let Some(ch) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(crate::IdError::InvalidChar {
            value: s.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Defines a `Copy` ID rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(InstanceId, "inst");
/// let parsed: InstanceId = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed, ULID-backed ID.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// Prefix written before the ULID.
            pub const PREFIX: &'static str = $prefix;

            /// Creates an ID from a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Wraps a ULID produced elsewhere, e.g. by a monotonic generator.
            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Parses `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let (prefix, ulid) = s.split_once('_').ok_or(if s.is_empty() {
                    $crate::IdError::Empty
                } else {
                    $crate::IdError::MissingSeparator
                })?;
                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }
                ulid.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        $crate::__impl_text_traits!($name);
    };
}

/// Macro to define a validated, operator-chosen name.
///
/// Names are stored verbatim and must be path-safe so they can be used as a
/// single coordination-store path segment.
#[macro_export]
macro_rules! define_name {
    ($name:ident) => {
        /// A typed, path-safe name.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Parses and validates a name.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::macros::validate_name(s)?;
                Ok(Self(s.to_string()))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        $crate::__impl_text_traits!($name);
    };
}

/// String conversions shared by every ID kind. Both forms round-trip
/// through `Display` and `parse`.
#[doc(hidden)]
#[macro_export]
macro_rules! __impl_text_traits {
    ($name:ident) => {
        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = $crate::IdError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
