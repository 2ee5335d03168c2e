//! Macros for defining typed ID types.

/// Macro to define a typed provider ID with a specific prefix.
///
/// This generates a newtype wrapper around the validated string with:
/// - A `PREFIX` constant
/// - `generate()` to mint a fresh ID (used by in-memory providers)
/// - `parse()` to parse from string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` as a plain string
///
/// # Example
///
/// ```ignore
/// define_id!(InstanceId, "i");
///
/// let parsed: InstanceId = "i-12345678".parse()?;
/// assert_eq!(parsed.as_str(), "i-12345678");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed provider ID for this resource kind.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a new ID with a random 8 hex digit suffix.
            #[must_use]
            pub fn generate() -> Self {
                let suffix: u32 = $crate::__rand::random();
                Self(format!("{}-{:08x}", Self::PREFIX, suffix))
            }

            /// Builds an ID from a sequence number, zero padded to 8 hex digits.
            #[must_use]
            pub fn from_seq(seq: u32) -> Self {
                Self(format!("{}-{:08x}", Self::PREFIX, seq))
            }

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}-{suffix}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, suffix)) = s.split_once('-') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let valid = !suffix.is_empty()
                    && suffix
                        .chars()
                        .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase());
                if !valid {
                    return Err($crate::IdError::InvalidSuffix(suffix.to_string()));
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the full ID string.
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

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
