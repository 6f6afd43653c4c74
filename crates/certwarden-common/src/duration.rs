//! Go-style duration strings ("2160h", "30m", "1h30m45s")
//!
//! Certificates and flags express lifetimes the way the Kubernetes
//! ecosystem does. Only h, m and s units are accepted; days are not.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A non-negative duration serialized as a Go duration string
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(std::time::Duration);

impl Duration {
    /// Build from whole seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    /// Build from whole hours
    pub const fn from_hours(hours: u64) -> Self {
        Self(std::time::Duration::from_secs(hours * 3600))
    }

    /// The wrapped std duration
    pub fn as_std(&self) -> std::time::Duration {
        self.0
    }

    /// The duration as a signed chrono duration
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self(d)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

/// Parse a duration string (e.g., "1h", "30m", "15s", "1h30m").
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let mut remaining = s;
    let mut total: u64 = 0;

    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return Err(format!(
                "expected a number at position {} in '{}'",
                s.len() - remaining.len(),
                s
            ));
        }
        let num: u64 = remaining[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", s))?;

        remaining = &remaining[num_end..];

        let Some(unit) = remaining.chars().next() else {
            return Err(format!("missing unit suffix (h/m/s) in duration '{}'", s));
        };
        let multiplier = match unit {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            other => {
                return Err(format!(
                    "invalid duration unit '{}' in '{}' (expected h, m, or s)",
                    other, s
                ))
            }
        };
        total = num
            .checked_mul(multiplier)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("duration '{}' overflows", s))?;
        remaining = &remaining[1..];
    }

    Ok(Duration::from_secs(total))
}

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs == 0 {
            return write!(f, "0s");
        }
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if h > 0 {
            write!(f, "{}h", h)?;
        }
        if m > 0 {
            write!(f, "{}m", m)?;
        }
        if s > 0 {
            write!(f, "{}s", s)?;
        }
        Ok(())
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Duration {
    fn schema_name() -> String {
        "Duration".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m45s").expect("duration should parse").as_std().as_secs(), 5445);
        assert_eq!(parse_duration("2160h").expect("duration should parse"), Duration::from_hours(2160));
        assert_eq!(parse_duration("0s").expect("duration should parse"), Duration::default());
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("90d").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("-5m").is_err());
    }

    #[test]
    fn display_round_trips_through_serde() {
        let d = Duration::from_secs(3600 + 120 + 3);
        assert_eq!(d.to_string(), "1h2m3s");

        let json = serde_json::to_string(&d).expect("serialization should succeed");
        assert_eq!(json, "\"1h2m3s\"");
        let back: Duration = serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, d);
    }

    #[test]
    fn deserialize_reports_bad_units() {
        let err = serde_json::from_str::<Duration>("\"30d\"").unwrap_err();
        assert!(err.to_string().contains("invalid duration unit"));
    }
}
