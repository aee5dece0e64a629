//! ISC-dhcpd-style text lease stores (§4.1/§4.2), persisted with
//! tmp-file + rename + fsync. Grounded on `original_source`'s
//! `lease_v4.c`/`lease_v6.c` on-disk format and the donor's `lease.rs`
//! redb-backed `LeaseManager` for the in-memory index shape (by-MAC,
//! by-IP lookup).

pub mod v4;
pub mod v6;

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Writes `contents` to `path` via `<path>.tmp` + `rename`, fsyncing both the
/// temp file and its parent directory before returning (§6's "Save is to
/// `<file>.tmp` then `rename`; both file and directory are fsynced").
pub(crate) fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp_path)?;
        use std::io::Write;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Formats a UTC timestamp as ISC-dhcpd's weekday-indexed text form:
/// `<w> YYYY/MM/DD HH:MM:SS` where `w` is 0=Sunday..6=Saturday.
pub(crate) fn format_isc_time(t: chrono::DateTime<chrono::Utc>) -> String {
    use chrono::{Datelike, Timelike, Weekday};
    let wd = match t.weekday() {
        Weekday::Sun => 0,
        Weekday::Mon => 1,
        Weekday::Tue => 2,
        Weekday::Wed => 3,
        Weekday::Thu => 4,
        Weekday::Fri => 5,
        Weekday::Sat => 6,
    };
    format!(
        "{} {:04}/{:02}/{:02} {:02}:{:02}:{:02}",
        wd,
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Parses either the `<w> YYYY/MM/DD HH:MM:SS` form or a bare epoch integer
/// back into a UTC timestamp (§4.1/§4.2: "Time parsing accepts both the
/// weekday form and a bare epoch"). The weekday digit in the former is
/// informational only and is not re-validated on parse, matching the
/// source's lenient reader.
pub(crate) fn parse_isc_time(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let trimmed = s.trim();

    if let Ok(epoch) = trimmed.parse::<i64>() {
        return chrono::DateTime::from_timestamp(epoch, 0);
    }

    let mut parts = trimmed.split_whitespace();
    let _weekday = parts.next()?;
    let date = parts.next()?;
    let time = parts.next()?;
    let combined = format!("{date} {time}");
    let naive = chrono::NaiveDateTime::parse_from_str(&combined, "%Y/%m/%d %H:%M:%S").ok()?;
    Some(chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc))
}
