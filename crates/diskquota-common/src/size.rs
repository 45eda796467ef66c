//! Size-string parsing for the quota management functions.
//!
//! Grammar: optional sign, decimal integer, optional unit `kB|MB|GB|TB`
//! (case-insensitive, whitespace allowed around the number). A bare number
//! is taken as megabytes. `-1` means "no limit", `0` means "deny all
//! writes"; any other negative value clears the quota like `-1`.

use crate::error::{Error, Result};

const MB_PER_GB: i64 = 1024;
const MB_PER_TB: i64 = 1024 * 1024;

/// Parse a human-readable size into whole megabytes.
///
/// Sub-megabyte sizes round up, so `"1 kB"` yields a 1 MB quota rather
/// than silently becoming unlimited.
pub fn parse_size_mb(input: &str) -> Result<i64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::InvalidSize(input.to_string()));
    }

    let (negative, rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return Err(Error::InvalidSize(input.to_string()));
    }
    let value: i64 = rest[..digits_end]
        .parse()
        .map_err(|_| Error::InvalidSize(input.to_string()))?;
    let unit = rest[digits_end..].trim();

    let mb = match unit.to_ascii_lowercase().as_str() {
        "" | "mb" => value,
        "kb" => {
            // round up so a tiny positive quota stays a quota
            (value + 1023) / 1024
        }
        "gb" => value
            .checked_mul(MB_PER_GB)
            .ok_or_else(|| Error::InvalidSize(input.to_string()))?,
        "tb" => value
            .checked_mul(MB_PER_TB)
            .ok_or_else(|| Error::InvalidSize(input.to_string()))?,
        other => {
            return Err(Error::InvalidSizeUnit {
                unit: other.to_string(),
            })
        }
    };

    Ok(if negative { -mb } else { mb })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_megabytes() {
        assert_eq!(parse_size_mb("1 MB").unwrap(), 1);
        assert_eq!(parse_size_mb("250MB").unwrap(), 250);
        assert_eq!(parse_size_mb("42").unwrap(), 42);
    }

    #[test]
    fn parses_units_case_insensitively() {
        assert_eq!(parse_size_mb("2 gb").unwrap(), 2048);
        assert_eq!(parse_size_mb("1 TB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_mb("2048 kB").unwrap(), 2);
    }

    #[test]
    fn sub_megabyte_rounds_up() {
        assert_eq!(parse_size_mb("1 kB").unwrap(), 1);
        assert_eq!(parse_size_mb("1025 kB").unwrap(), 2);
    }

    #[test]
    fn negative_and_zero() {
        assert_eq!(parse_size_mb("-1").unwrap(), -1);
        assert_eq!(parse_size_mb("0").unwrap(), 0);
        assert_eq!(parse_size_mb("-2 GB").unwrap(), -2048);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_size_mb(""), Err(Error::InvalidSize(_))));
        assert!(matches!(parse_size_mb("MB"), Err(Error::InvalidSize(_))));
        assert!(matches!(
            parse_size_mb("10 PBx"),
            Err(Error::InvalidSizeUnit { .. })
        ));
        assert!(matches!(
            parse_size_mb("10 pb"),
            Err(Error::InvalidSizeUnit { .. })
        ));
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(parse_size_mb("9223372036854775807 TB").is_err());
    }
}
