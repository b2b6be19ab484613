/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Log sequence numbers. An LSN is a pair of 32-bit halves written as an
//! upper-case hex pair (`1A/2F0`), monotonically non-decreasing along the
//! server's WAL. No ordering other than LSN is ever used to sequence server
//! changes.

use crate::error::{Error, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Typesafe way to manage LSNs without accidentally mixing them up with
/// other integers. Ordering is lexicographic on `(major, minor)`, which the
/// derived `Ord` gives us for free.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    pub major: u32,
    pub minor: u32,
}

impl Lsn {
    /// The `0/0` sentinel: "no LSN applied yet". A replica announcing this
    /// gets a full initial sync.
    pub const ZERO: Lsn = Lsn { major: 0, minor: 0 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Parses the canonical `HH/HH` form: exactly one `/`, both halves hex,
    /// each fitting in 32 bits.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(major), Some(minor), None) if !major.is_empty() && !minor.is_empty() => {
                let major =
                    u32::from_str_radix(major, 16).map_err(|_| Error::InvalidLsn(s.into()))?;
                let minor =
                    u32::from_str_radix(minor, 16).map_err(|_| Error::InvalidLsn(s.into()))?;
                Ok(Lsn { major, minor })
            }
            _ => Err(Error::InvalidLsn(s.into())),
        }
    }
}

impl fmt::Display for Lsn {
    /// Canonical form: upper-case hex, no leading zeros in either half.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.major, self.minor)
    }
}

impl FromStr for Lsn {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Lsn::parse(s)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct LsnVisitor;

        impl<'de> Visitor<'de> for LsnVisitor {
            type Value = Lsn;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an LSN string of the form HH/HH")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Lsn, E> {
                Lsn::parse(value).map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_str(LsnVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        assert_eq!(Lsn::parse("0/0").unwrap(), Lsn::ZERO);
        assert_eq!(Lsn::parse("1A/2F0").unwrap(), Lsn::new(0x1A, 0x2F0));
        // lower case and leading zeros are accepted on input
        assert_eq!(Lsn::parse("00ff/00a").unwrap(), Lsn::new(0xFF, 0xA));
        assert_eq!(
            Lsn::parse("FFFFFFFF/FFFFFFFF").unwrap(),
            Lsn::new(u32::MAX, u32::MAX)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "", "0", "0/", "/0", "0/0/0", "G/0", "0/G", "0x1/2", " 1/2", "1/2 ",
            "100000000/0", // > 32 bits
        ] {
            assert!(Lsn::parse(bad).is_err(), "should reject {:?}", bad);
        }
    }

    #[test]
    fn test_format_strips_leading_zeros() {
        assert_eq!(Lsn::parse("00ff/0001").unwrap().to_string(), "FF/1");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let ordered = ["0/0", "0/1", "0/FF", "1/0", "1/1", "2/0", "FF/FE"];
        let parsed: Vec<Lsn> = ordered.iter().map(|s| Lsn::parse(s).unwrap()).collect();
        let mut sorted = parsed.clone();
        sorted.sort();
        assert_eq!(parsed, sorted);
        assert!(Lsn::new(1, 0) > Lsn::new(0, u32::MAX));
    }

    #[test]
    fn test_serde_string_form() {
        let lsn = Lsn::new(0x1A, 0x2F0);
        assert_eq!(serde_json::to_string(&lsn).unwrap(), "\"1A/2F0\"");
        let back: Lsn = serde_json::from_str("\"1a/2f0\"").unwrap();
        assert_eq!(back, lsn);
        assert!(serde_json::from_str::<Lsn>("\"nope\"").is_err());
        assert!(serde_json::from_str::<Lsn>("17").is_err());
    }
}
