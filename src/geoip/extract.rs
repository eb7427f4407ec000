//! Offline builder for the range file, fed by the GeoLite2 country CSVs.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::Ipv4Addr;

use super::{GeoError, GeoTable, IpRange};

/// Reads `Country-Locations-en` and `Country-Blocks-IPv4` and returns the
/// merged table of networks assigned to `country` (ISO 3166 code).
pub fn build_table<B: Read, L: Read>(
    blocks: B,
    locations: L,
    country: &str,
) -> Result<GeoTable, GeoError> {
    let geoname_ids = country_geoname_ids(locations, country)?;

    let mut reader = csv::Reader::from_reader(blocks);
    let mut ranges = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let (Some(network), Some(geoname_id)) = (record.get(0), record.get(1)) else {
            continue;
        };
        if !geoname_ids.contains(geoname_id) {
            continue;
        }
        let range = parse_network(network).ok_or_else(|| GeoError::Parse {
            line: idx + 2,
            reason: format!("bad network {network:?}"),
        })?;
        ranges.push(range);
    }

    tracing::debug!(country, networks = ranges.len(), "Collected networks");
    GeoTable::from_ranges(merge(ranges))
}

fn country_geoname_ids<L: Read>(locations: L, country: &str) -> Result<HashSet<String>, GeoError> {
    let mut reader = csv::Reader::from_reader(locations);
    let mut ids = HashSet::new();
    for record in reader.records() {
        let record = record?;
        if record
            .get(4)
            .map_or(false, |code| code.eq_ignore_ascii_case(country))
        {
            if let Some(id) = record.get(0) {
                ids.insert(id.to_string());
            }
        }
    }
    Ok(ids)
}

fn parse_network(network: &str) -> Option<IpRange> {
    let (addr, prefix) = network.split_once('/')?;
    let addr = addr.parse::<Ipv4Addr>().ok()?;
    let prefix = prefix.parse::<u8>().ok()?;
    IpRange::from_cidr(addr, prefix)
}

/// Sorts ranges and merges the ones that touch or overlap.
pub fn merge(mut ranges: Vec<IpRange>) -> Vec<IpRange> {
    ranges.sort();
    let mut merged: Vec<IpRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.lo <= last.hi.saturating_add(1) => {
                last.hi = last.hi.max(range.hi);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Writes the table in the `lo-hi` line format [`GeoTable::parse`] reads.
pub fn write_table<W: Write>(table: &GeoTable, mut out: W) -> std::io::Result<()> {
    writeln!(out, "# {} ranges, generated by egress geoip build", table.len())?;
    for range in table.ranges() {
        writeln!(out, "{range}")?;
    }
    out.flush()
}
