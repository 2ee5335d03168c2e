//! Per-resource-kind state enums.

use std::fmt::{Debug, Display};

/// A provider state for one resource kind.
///
/// Every kind maps the provider's raw status strings onto an enum with an
/// explicit unmapped variant; `is_unknown` reports that variant.
pub trait ResourceState: Debug + Display + Clone + PartialEq + Send + Sync + 'static {
    fn is_unknown(&self) -> bool;
}

/// Define a state enum with a catch-all `Unknown(String)` variant.
///
/// ```ignore
/// define_state!(VolumeState {
///     Creating => "creating",
///     Available => "available",
/// });
///
/// assert_eq!(VolumeState::from_provider("available"), VolumeState::Available);
/// assert!(VolumeState::from_provider("weird").is_unknown());
/// ```
#[macro_export]
macro_rules! define_state {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            /// A status string this adapter does not map.
            Unknown(String),
        }

        impl $name {
            /// Map a raw provider status string.
            pub fn from_provider(raw: &str) -> Self {
                match raw {
                    $($wire => Self::$variant,)+
                    other => Self::Unknown(other.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Unknown(raw) => raw,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl $crate::ResourceState for $name {
            fn is_unknown(&self) -> bool {
                matches!(self, Self::Unknown(_))
            }
        }
    };
}
