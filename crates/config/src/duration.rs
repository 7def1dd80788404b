//! Human-friendly durations (`"50ms"`, `"10s"`, `"5m"`, `"2h"`, `"1d"`) for settings.

use std::time::Duration;

use crate::{Error, Result};

/// Parse a duration string with a unit suffix.
///
/// Supported suffixes: `ms`, `s`, `m`, `h`, `d`. Zero is rejected since every
/// setting that takes a duration must be positive.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_duration(input, "empty duration string"));
    }

    let Some(split) = trimmed.find(|c: char| c.is_alphabetic()) else {
        return Err(Error::invalid_duration(
            input,
            "missing unit suffix (ms/s/m/h/d)",
        ));
    };
    let (num_str, suffix) = trimmed.split_at(split);

    let value: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::invalid_duration(input, format!("invalid number: {num_str}")))?;
    if value == 0 {
        return Err(Error::invalid_duration(input, "duration must be > 0"));
    }

    let millis_per_unit: u64 = match suffix {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(Error::invalid_duration(
                input,
                format!("unknown suffix: {other} (expected ms/s/m/h/d)"),
            ));
        },
    };

    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| Error::invalid_duration(input, "duration overflows"))
}

/// Render a duration with the largest unit that divides it exactly.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    const UNITS: [(u128, &str); 4] = [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    for (size, suffix) in UNITS {
        if ms >= size && ms % size == 0 {
            return format!("{}{suffix}", ms / size);
        }
    }
    format!("{ms}ms")
}

/// Serde adapter: durations are written as strings and read from either a
/// string or a plain integer number of milliseconds.
pub mod serde_human {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(u64),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
            Raw::Millis(0) => Err(de::Error::custom("duration must be > 0")),
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("50ms", 50)]
    #[case("10s", 10_000)]
    #[case("5m", 300_000)]
    #[case("2h", 7_200_000)]
    #[case("1d", 86_400_000)]
    #[case("  10m  ", 600_000)]
    fn parses_suffixes(#[case] input: &str, #[case] millis: u64) {
        assert_eq!(parse_duration(input).unwrap(), Duration::from_millis(millis));
    }

    #[rstest]
    #[case("")]
    #[case("100")]
    #[case("0s")]
    #[case("10x")]
    #[case("abc")]
    fn rejects_bad_input(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn formats_with_largest_exact_unit() {
        assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(86_400)), "1d");
    }
}
