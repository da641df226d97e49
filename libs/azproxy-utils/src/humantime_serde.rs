//! Serde adapters for `std::time::Duration` in configuration files.
//!
//! Durations are written the `humantime` way (`"250ms"`, `"1m 30s"`). Bare
//! integers, and strings made only of digits, are read as whole seconds so
//! that legacy variables such as `REQUEST_TIMEOUT=60` keep working.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Timeouts {
//!     #[serde(with = "azproxy_utils::humantime_serde")]
//!     connect: Duration,
//!     #[serde(default, with = "azproxy_utils::humantime_serde::option")]
//!     deadline: Option<Duration>,
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserializer, Serializer, de};

/// Serialize a duration as a humantime string.
///
/// # Errors
/// Propagates serializer errors.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*value))
}

/// Deserialize a duration from a humantime string or a number of seconds.
///
/// # Errors
/// Returns a serde error when the value is neither.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    deserializer.deserialize_any(DurationVisitor)
}

struct DurationVisitor;

impl de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration such as \"30s\" or a number of seconds")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
        let trimmed = v.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return trimmed
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self));
        }
        humantime::parse_duration(trimmed)
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

pub mod option {
    //! Same as the parent module, for `Option<Duration>`; `null` maps to `None`.

    use std::fmt;
    use std::time::Duration;

    use serde::{Deserializer, Serializer, de};

    /// # Errors
    /// Propagates serializer errors.
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    /// # Errors
    /// Returns a serde error for values that are not durations.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        deserializer.deserialize_option(OptionVisitor)
    }

    struct OptionVisitor;

    impl<'de> de::Visitor<'de> for OptionVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an optional duration")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            super::deserialize(d).map(Some)
        }
    }
}
