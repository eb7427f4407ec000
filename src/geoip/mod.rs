//! IPv4 range classifier.
//!
//! A [`GeoTable`] is a sorted list of closed, non-overlapping IPv4 ranges.
//! Membership is a binary search for the first range whose upper bound is
//! not below the address. The table is immutable once loaded; it is either
//! compiled in from `data/domestic_ipv4.txt` or read from a file produced by
//! `egress geoip build`.

pub mod extract;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const EMBEDDED_TABLE: &str = include_str!("../../data/domestic_ipv4.txt");

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Range {current} starts before the previous range {previous}")]
    Unsorted { previous: IpRange, current: IpRange },

    #[error("Range {current} overlaps {previous}")]
    Overlap { previous: IpRange, current: IpRange },

    #[error("Range {0} has lo > hi")]
    Inverted(IpRange),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A closed range of IPv4 addresses, `lo..=hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    pub lo: u32,
    pub hi: u32,
}

impl IpRange {
    pub fn new(lo: Ipv4Addr, hi: Ipv4Addr) -> Self {
        Self {
            lo: u32::from(lo),
            hi: u32::from(hi),
        }
    }

    pub fn from_cidr(network: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        let host_bits = 32 - u32::from(prefix);
        let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
        let lo = u32::from(network) & mask;
        Some(Self { lo, hi: lo | !mask })
    }

    pub fn contains(&self, ip: u32) -> bool {
        self.lo <= ip && ip <= self.hi
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", Ipv4Addr::from(self.lo), Ipv4Addr::from(self.hi))
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((net, prefix)) = s.split_once('/') {
            let net = Ipv4Addr::from_str(net.trim()).map_err(|e| e.to_string())?;
            let prefix = prefix
                .trim()
                .parse::<u8>()
                .map_err(|e| format!("bad prefix length: {e}"))?;
            return IpRange::from_cidr(net, prefix)
                .ok_or_else(|| format!("prefix length {prefix} out of range"));
        }
        if let Some((lo, hi)) = s.split_once('-') {
            let lo = Ipv4Addr::from_str(lo.trim()).map_err(|e| e.to_string())?;
            let hi = Ipv4Addr::from_str(hi.trim()).map_err(|e| e.to_string())?;
            return Ok(IpRange::new(lo, hi));
        }
        let single = Ipv4Addr::from_str(s.trim()).map_err(|e| e.to_string())?;
        Ok(IpRange::new(single, single))
    }
}

/// Immutable, sorted IPv4 range table.
#[derive(Debug, Clone, Default)]
pub struct GeoTable {
    ranges: Vec<IpRange>,
}

impl GeoTable {
    /// Builds a table, rejecting ranges that are inverted, out of order or
    /// overlapping.
    pub fn from_ranges(ranges: Vec<IpRange>) -> Result<Self, GeoError> {
        for range in &ranges {
            if range.lo > range.hi {
                return Err(GeoError::Inverted(*range));
            }
        }
        for pair in ranges.windows(2) {
            let (previous, current) = (pair[0], pair[1]);
            if current.lo < previous.lo {
                return Err(GeoError::Unsorted { previous, current });
            }
            if current.lo <= previous.hi {
                return Err(GeoError::Overlap { previous, current });
            }
        }
        Ok(Self { ranges })
    }

    pub fn parse(text: &str) -> Result<Self, GeoError> {
        let mut ranges = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let range = line.parse::<IpRange>().map_err(|reason| GeoError::Parse {
                line: idx + 1,
                reason,
            })?;
            ranges.push(range);
        }
        Self::from_ranges(ranges)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// The domestic table compiled into the binary. It is a coarse seed of
    /// the largest carrier allocations, not a full country table.
    pub fn embedded() -> Result<Self, GeoError> {
        Self::parse(EMBEDDED_TABLE)
    }

    /// Loads `path` when given, otherwise falls back to the embedded seed.
    /// The fallback is logged at warn level when `routing_by_geo` is set.
    pub fn load_or_embedded(path: Option<&Path>, routing_by_geo: bool) -> Result<Self, GeoError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let table = Self::embedded()?;
        if routing_by_geo {
            tracing::warn!(
                ranges = table.len(),
                "No local.geoip_table configured; smart routing uses the embedded seed table. \
                 Build a full table with `egress geoip build` and set local.geoip_table"
            );
        }
        Ok(table)
    }

    /// Membership test. IPv4-mapped IPv6 addresses are unwrapped; any other
    /// IPv6 address never matches.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.contains_v4(v4),
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map_or(false, |v4| self.contains_v4(v4)),
        }
    }

    pub fn contains_v4(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        let idx = self.ranges.partition_point(|r| r.hi < n);
        self.ranges.get(idx).map_or(false, |r| r.contains(n))
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn test_embedded_table_boundaries() {
        let table = GeoTable::embedded().expect("embedded table must parse");

        assert!(!table.contains_v4(v4(0, 0, 0, 0)));
        assert!(!table.contains_v4(v4(1, 0, 0, 255)));

        assert!(table.contains_v4(v4(1, 0, 1, 0)));
        assert!(table.contains_v4(v4(1, 0, 1, 255)));
        assert!(table.contains_v4(v4(1, 0, 2, 0)));
        assert!(table.contains_v4(v4(1, 0, 3, 255)));

        assert!(!table.contains_v4(v4(1, 0, 4, 0)));
        assert!(!table.contains_v4(v4(1, 0, 7, 255)));

        assert!(table.contains_v4(v4(223, 255, 252, 0)));
        assert!(table.contains_v4(v4(223, 255, 253, 255)));
        assert!(!table.contains_v4(v4(223, 255, 254, 0)));
        assert!(!table.contains_v4(v4(255, 255, 255, 255)));
    }

    #[test]
    fn test_embedded_table_known_hosts() {
        let table = GeoTable::embedded().expect("embedded table must parse");

        assert!(table.contains_v4(v4(123, 125, 114, 144)));
        assert!(table.contains_v4(v4(220, 181, 57, 217)));
        assert!(table.contains_v4(v4(14, 17, 69, 22)));

        assert!(!table.contains_v4(v4(195, 13, 189, 34)));
        assert!(!table.contains_v4(v4(74, 125, 227, 231)));
    }

    #[test]
    fn test_range_edges() {
        let table = GeoTable::parse("10.0.0.0-10.0.0.9\n10.0.0.20-10.0.0.29\n").unwrap();
        for range in table.ranges() {
            assert!(table.contains_v4(Ipv4Addr::from(range.lo)));
            assert!(table.contains_v4(Ipv4Addr::from(range.hi)));
            assert!(!table.contains_v4(Ipv4Addr::from(range.hi + 1)));
        }
    }

    #[test]
    fn test_adjacent_ranges_hi_plus_one_hits_next() {
        let table = GeoTable::parse("10.0.0.0/31\n10.0.0.2/31\n").unwrap();
        assert!(table.contains_v4(v4(10, 0, 0, 1)));
        assert!(table.contains_v4(v4(10, 0, 0, 2)));
        assert!(!table.contains_v4(v4(10, 0, 0, 4)));
    }

    #[test]
    fn test_ipv6_handling() {
        let table = GeoTable::embedded().unwrap();
        let mapped: IpAddr = "::ffff:1.0.1.7".parse().unwrap();
        let native: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(table.contains(mapped));
        assert!(!table.contains(native));
    }

    #[test]
    fn test_rejects_unsorted_and_overlapping() {
        assert!(matches!(
            GeoTable::parse("10.0.1.0/24\n10.0.0.0/24\n"),
            Err(GeoError::Unsorted { .. })
        ));
        assert!(matches!(
            GeoTable::parse("10.0.0.0/16\n10.0.1.0/24\n"),
            Err(GeoError::Overlap { .. })
        ));
        assert!(matches!(
            GeoTable::parse("10.0.0.9-10.0.0.1\n"),
            Err(GeoError::Inverted(_))
        ));
    }

    #[test]
    fn test_parse_errors_report_line() {
        let err = GeoTable::parse("# header\n\n10.0.0.0/33\n").unwrap_err();
        assert!(matches!(err, GeoError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_cidr_edges() {
        assert_eq!(
            IpRange::from_cidr(v4(0, 0, 0, 0), 0),
            Some(IpRange { lo: 0, hi: u32::MAX })
        );
        let host = IpRange::from_cidr(v4(8, 8, 8, 8), 32).unwrap();
        assert_eq!(host.lo, host.hi);
        assert_eq!(host.to_string(), "8.8.8.8-8.8.8.8");
    }

    #[test]
    fn test_empty_table_matches_nothing() {
        let table = GeoTable::default();
        assert!(table.is_empty());
        assert!(!table.contains_v4(v4(1, 2, 3, 4)));
    }

    #[test]
    fn test_well_known_addresses() {
        let table = GeoTable::embedded().unwrap();

        assert!(!table.contains_v4(v4(255, 255, 255, 255)));
        assert!(table.contains_v4(v4(123, 125, 114, 144)));
        assert!(table.contains_v4(v4(220, 181, 57, 217)));
        assert!(table.contains_v4(v4(39, 156, 66, 10)));
        assert!(table.contains_v4(v4(14, 17, 69, 22)));
        assert!(!table.contains_v4(v4(195, 13, 189, 34)));
        assert!(!table.contains_v4(v4(74, 125, 227, 231)));
    }

    #[test]
    fn test_configured_table_replaces_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domestic.txt");
        std::fs::write(&path, "# custom\n74.125.0.0/16\n").unwrap();

        let table = GeoTable::load_or_embedded(Some(&path), true).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_v4(v4(74, 125, 227, 231)));
        assert!(!table.contains_v4(v4(123, 125, 114, 144)));

        let seed = GeoTable::load_or_embedded(None, false).unwrap();
        assert_eq!(seed.len(), GeoTable::embedded().unwrap().len());
    }

    #[test]
    fn test_missing_configured_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.txt");
        assert!(matches!(
            GeoTable::load_or_embedded(Some(&missing), true),
            Err(GeoError::Io(_))
        ));
    }
}
