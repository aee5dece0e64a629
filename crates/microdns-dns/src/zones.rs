//! ZoneStore (the ZoneLoader boundary named in §2): loads the zone files
//! named by the config's `zone "<name>" { file "<f>"; }` blocks into the
//! in-memory `Zone`/`ZoneRecord` model, and answers the name+type lookups
//! the resolver's authoritative path needs.
//!
//! The on-disk grammar is a flat, whitespace-separated line format —
//! `<owner> <TYPE> <rdata...>`, with `@` standing for the zone apex and one
//! `SOA` line carrying the zone's authority fields. This is deliberately
//! simpler than BIND's master-file grammar (no `$INCLUDE`, no parenthesized
//! multi-line records): the loader is a boundary whose exact grammar the
//! spec leaves unspecified, so it only needs to round-trip what this crate
//! itself writes and reads.

use microdns_core::error::DnsError;
use microdns_core::types::{RecordType, Soa, Zone, ZoneRecord};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub struct ZoneStore {
    zones: HashMap<String, Zone>,
    records: HashMap<String, Vec<ZoneRecord>>,
}

impl ZoneStore {
    pub fn load(configs: &[microdns_core::config::ZoneConfig]) -> Result<Self, DnsError> {
        let mut zones = HashMap::new();
        let mut records = HashMap::new();

        for zc in configs {
            let (zone, recs) = load_zone_file(&zc.name, &zc.file)?;
            records.insert(zone.name.clone(), recs);
            zones.insert(zone.name.clone(), zone);
        }

        Ok(Self { zones, records })
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    #[cfg(test)]
    pub fn test_store(zones: Vec<Zone>, records: Vec<ZoneRecord>) -> Self {
        let mut zone_map = HashMap::new();
        let mut record_map: HashMap<String, Vec<ZoneRecord>> = HashMap::new();
        for zone in zones {
            zone_map.insert(zone.name.clone(), zone);
        }
        for rec in records {
            let zone_name = zone_map
                .values()
                .find(|z| z.id == rec.zone_id)
                .map(|z| z.name.clone())
                .unwrap_or_default();
            record_map.entry(zone_name).or_default().push(rec);
        }
        Self { zones: zone_map, records: record_map }
    }

    /// Finds the most specific loaded zone that `name` falls within.
    pub fn find_zone_for_name(&self, name: &str) -> Option<&Zone> {
        let name = name.trim_end_matches('.').to_lowercase();
        self.zones
            .values()
            .filter(|z| name == z.name || name.ends_with(&format!(".{}", z.name)))
            .max_by_key(|z| z.name.len())
    }

    /// Records at `name` of type `rtype` within `zone`.
    pub fn lookup(&self, zone: &Zone, name: &str, rtype: RecordType) -> Vec<&ZoneRecord> {
        let name = name.trim_end_matches('.').to_lowercase();
        self.records
            .get(&zone.name)
            .map(|recs| recs.iter().filter(|r| r.name == name && r.rtype == rtype).collect())
            .unwrap_or_default()
    }

    /// Whether any record at all exists at `name` within `zone`, regardless
    /// of type — distinguishes NXDOMAIN from NODATA for the negative answer.
    pub fn has_any(&self, zone: &Zone, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();
        self.records
            .get(&zone.name)
            .map(|recs| recs.iter().any(|r| r.name == name))
            .unwrap_or(false)
    }
}

fn load_zone_file(zone_name: &str, path: &Path) -> Result<(Zone, Vec<ZoneRecord>), DnsError> {
    let content = std::fs::read_to_string(path).map_err(|e| DnsError::ZoneLoad {
        path: path.display().to_string(),
        source: e,
    })?;

    let zone_id = Uuid::new_v4();
    let zone_name = zone_name.trim_end_matches('.').to_lowercase();
    let mut soa: Option<Soa> = None;
    let mut records = Vec::new();
    let mut default_ttl = 3600u32;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            tracing::warn!(zone = %zone_name, line, "skipping malformed zone file line");
            continue;
        }

        let owner = fields[0].trim_end_matches('.').to_lowercase();
        let owner = if owner == "@" {
            zone_name.clone()
        } else if owner.ends_with(&zone_name) {
            owner
        } else {
            format!("{owner}.{zone_name}")
        };
        let rtype_str = fields[1].to_uppercase();

        if rtype_str == "SOA" {
            if fields.len() < 9 {
                tracing::warn!(zone = %zone_name, line, "skipping malformed SOA line");
                continue;
            }
            let parsed = Soa {
                mname: fields[2].trim_end_matches('.').to_string(),
                rname: fields[3].trim_end_matches('.').to_string(),
                serial: fields[4].parse().unwrap_or(0),
                refresh: fields[5].parse().unwrap_or(3600),
                retry: fields[6].parse().unwrap_or(900),
                expire: fields[7].parse().unwrap_or(604800),
                minimum: fields[8].parse().unwrap_or(3600),
            };
            default_ttl = parsed.minimum;
            soa = Some(parsed);
            continue;
        }

        let rtype = match rtype_str.parse::<RecordType>() {
            Ok(rt) => rt,
            Err(_) => {
                tracing::warn!(zone = %zone_name, rtype = %rtype_str, "skipping unsupported record type in zone file");
                continue;
            }
        };

        records.push(ZoneRecord {
            zone_id,
            name: owner,
            rtype,
            ttl: default_ttl,
            rdata: fields[2..].join(" "),
        });
    }

    let soa = soa.unwrap_or_else(|| Soa {
        mname: format!("ns1.{zone_name}"),
        rname: format!("admin.{zone_name}"),
        serial: 1,
        refresh: 3600,
        retry: 900,
        expire: 604800,
        minimum: default_ttl,
    });

    Ok((
        Zone {
            id: zone_id,
            name: zone_name,
            default_ttl,
            soa,
        },
        records,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zone_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn default_soa(name: &str) -> Soa {
        Soa {
            mname: format!("ns1.{name}"),
            rname: format!("admin.{name}"),
            serial: 1,
            refresh: 3600,
            retry: 900,
            expire: 604800,
            minimum: 3600,
        }
    }

    #[test]
    fn loads_records_and_soa() {
        let f = write_zone_file(
            "@ SOA ns1.example.com. admin.example.com. 2024010100 3600 900 604800 3600\n\
             www A 192.0.2.10\n\
             @ NS ns1.example.com.\n",
        );
        let (zone, records) = load_zone_file("example.com", f.path()).unwrap();
        assert_eq!(zone.name, "example.com");
        assert_eq!(zone.soa.serial, 2024010100);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "www.example.com");
        assert_eq!(records[0].rdata, "192.0.2.10");
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let f = write_zone_file("garbage\nwww A 192.0.2.10\n");
        let (_zone, records) = load_zone_file("example.com", f.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn find_zone_for_name_matches_most_specific() {
        let mut zones = HashMap::new();
        zones.insert(
            "example.com".to_string(),
            Zone {
                id: Uuid::new_v4(),
                name: "example.com".to_string(),
                default_ttl: 3600,
                soa: default_soa("example.com"),
            },
        );
        zones.insert(
            "dev.example.com".to_string(),
            Zone {
                id: Uuid::new_v4(),
                name: "dev.example.com".to_string(),
                default_ttl: 3600,
                soa: default_soa("dev.example.com"),
            },
        );
        let store = ZoneStore {
            zones,
            records: HashMap::new(),
        };

        let z = store.find_zone_for_name("host.dev.example.com").unwrap();
        assert_eq!(z.name, "dev.example.com");
        assert!(store.find_zone_for_name("other.net").is_none());
    }
}
