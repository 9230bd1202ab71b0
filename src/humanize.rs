//! Human-readable size parsing for configuration values

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid size format: {0}")]
    InvalidFormat(String),

    #[error("invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("invalid unit: {0}")]
    InvalidUnit(String),
}

/// Byte size wrapper with human-readable parsing ("10MB", "512KB", "1048576")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[(&str, u64)] = &[
            ("TB", 1024 * 1024 * 1024 * 1024),
            ("GB", 1024 * 1024 * 1024),
            ("MB", 1024 * 1024),
            ("KB", 1024),
        ];

        for &(unit, divisor) in UNITS {
            if self.0 >= divisor && self.0 % divisor == 0 {
                return write!(f, "{}{}", self.0 / divisor, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let value: u64 = digits.parse()?;
        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "KB" | "KIB" | "K" => 1024,
            "MB" | "MIB" | "M" => 1024 * 1024,
            "GB" | "GIB" | "G" => 1024 * 1024 * 1024,
            "TB" | "TIB" | "T" => 1024u64 * 1024 * 1024 * 1024,
            other => return Err(ParseError::InvalidUnit(other.to_string())),
        };

        Ok(ByteSize(value * multiplier))
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl serde::de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a size string like \"10MB\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("byte size must be non-negative"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("0".parse::<ByteSize>().unwrap(), ByteSize(0));
    }

    #[test]
    fn parses_units() {
        assert_eq!("10MB".parse::<ByteSize>().unwrap(), ByteSize(10 * 1024 * 1024));
        assert_eq!("512kb".parse::<ByteSize>().unwrap(), ByteSize(512 * 1024));
        assert_eq!("1 GB".parse::<ByteSize>().unwrap(), ByteSize(1024 * 1024 * 1024));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("MB".parse::<ByteSize>().is_err());
        assert!("10XB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn displays_round_values() {
        assert_eq!(ByteSize(10 * 1024 * 1024).to_string(), "10MB");
        assert_eq!(ByteSize(1000).to_string(), "1000B");
    }

    #[test]
    fn deserializes_from_toml_string_and_int() {
        #[derive(Deserialize)]
        struct Wrapper {
            size: ByteSize,
        }

        let w: Wrapper = toml::from_str(r#"size = "5MB""#).unwrap();
        assert_eq!(w.size, ByteSize(5 * 1024 * 1024));

        let w: Wrapper = toml::from_str("size = 4096").unwrap();
        assert_eq!(w.size, ByteSize(4096));
    }
}
