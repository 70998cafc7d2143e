//! Small parsing and normalization helpers shared by the profile modules.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::Weekday;
use serde::Deserialize;
use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeSeq, Serializer};
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};

/// Parses a stored identifier, mapping failures to [`ConfigError::InvalidUuid`].
///
/// # Errors
///
/// Returns [`ConfigError::InvalidUuid`] when the value is not a UUID.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn parse_uuid(value: &str) -> ConfigResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| ConfigError::InvalidUuid {
        value: value.to_owned(),
    })
}

/// Parses an HTTP bind address.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidBindAddr`] when the value is not an IP
/// address literal.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn parse_bind_addr(value: &str) -> ConfigResult<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidBindAddr {
            value: value.to_owned(),
        })
}

/// Parses a wall-clock `"HH:MM"` label into minutes past midnight.
///
/// Returns `None` for anything outside `00:00..=23:59` or not shaped like a
/// clock time; schedule normalization treats that as a malformed schedule.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn parse_minutes(value: &str) -> Option<u16> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Renders minutes past midnight back into the `"HH:MM"` wire shape.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn format_minutes(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Maps a human weekday label onto [`chrono::Weekday`].
///
/// Accepts full names and common abbreviations, case-insensitively. Returns
/// `None` for labels that name no weekday.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn parse_weekday_label(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tues" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thur" | "thurs" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Canonical three-letter label for a weekday.
#[allow(clippy::redundant_pub_crate)]
pub(crate) const fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

/// Serde helper rendering weekdays as their canonical labels.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn serialize_weekdays<S>(days: &[Weekday], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(days.len()))?;
    for day in days {
        seq.serialize_element(weekday_label(*day))?;
    }
    seq.end()
}

/// Serde helper parsing weekday labels back into [`chrono::Weekday`].
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn deserialize_weekdays<'de, D>(deserializer: D) -> Result<Vec<Weekday>, D::Error>
where
    D: Deserializer<'de>,
{
    let labels = Vec::<String>::deserialize(deserializer)?;
    labels
        .iter()
        .map(|label| {
            parse_weekday_label(label)
                .ok_or_else(|| DeError::custom(format!("unknown weekday label: {label}")))
        })
        .collect()
}

/// Trims entries, drops empties, and removes duplicates keeping the first
/// occurrence. Order is otherwise preserved.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn normalize_string_list(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_owned()) {
            out.push(trimmed.to_owned());
        }
    }
    out
}

/// Trims a scalar and maps blank input to `None`.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Validates an octal permission string such as `"0755"` or `"644"`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when the string is not three or four
/// octal digits.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn validate_octal_mode(section: &str, field: &str, value: &str) -> ConfigResult<()> {
    let digits = value.as_bytes();
    let valid =
        (3..=4).contains(&digits.len()) && digits.iter().all(|byte| matches!(byte, b'0'..=b'7'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidField {
            section: section.to_owned(),
            field: field.to_owned(),
            value: Some(value.to_owned()),
            reason: "expected three or four octal digits",
        })
    }
}

/// Trims a path-like scalar, substituting the fallback when blank.
#[allow(clippy::redundant_pub_crate)]
pub(crate) fn sanitize_path(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::{
        format_minutes, normalize_string_list, parse_bind_addr, parse_minutes,
        parse_weekday_label, validate_octal_mode,
    };

    #[test]
    fn minutes_parse_and_render_round_trip() {
        assert_eq!(parse_minutes("00:00"), Some(0));
        assert_eq!(parse_minutes("23:59"), Some(1439));
        assert_eq!(parse_minutes(" 07:30 "), Some(450));
        assert_eq!(parse_minutes("24:00"), None);
        assert_eq!(parse_minutes("12:60"), None);
        assert_eq!(parse_minutes("noon"), None);
        assert_eq!(format_minutes(450), "07:30");
        assert_eq!(format_minutes(1439), "23:59");
    }

    #[test]
    fn weekday_labels_accept_common_spellings() {
        assert_eq!(parse_weekday_label("Monday"), Some(Weekday::Mon));
        assert_eq!(parse_weekday_label("tues"), Some(Weekday::Tue));
        assert_eq!(parse_weekday_label(" SUN "), Some(Weekday::Sun));
        assert_eq!(parse_weekday_label("noday"), None);
    }

    #[test]
    fn string_lists_dedup_preserving_first_occurrence() {
        let input = vec![
            " eth0 ".to_owned(),
            "wlan0".to_owned(),
            String::new(),
            "eth0".to_owned(),
        ];
        let normalized = normalize_string_list(&input);
        assert_eq!(normalized, vec!["eth0", "wlan0"]);
        // Already-normalized input passes through untouched.
        assert_eq!(normalize_string_list(&normalized), normalized);
    }

    #[test]
    fn octal_modes_reject_stray_digits() {
        assert!(validate_octal_mode("fs", "chmod_file", "0755").is_ok());
        assert!(validate_octal_mode("fs", "chmod_file", "644").is_ok());
        assert!(validate_octal_mode("fs", "chmod_file", "0868").is_err());
        assert!(validate_octal_mode("fs", "chmod_file", "07555").is_err());
        assert!(validate_octal_mode("fs", "chmod_file", "rw").is_err());
    }

    #[test]
    fn bind_addresses_must_be_ip_literals() {
        assert!(parse_bind_addr("0.0.0.0").is_ok());
        assert!(parse_bind_addr("::1").is_ok());
        assert!(parse_bind_addr("localhost").is_err());
    }
}
