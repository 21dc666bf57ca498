//! WAL file geometry and naming, plus the directory scans the server uses
//! to locate the durable end of the WAL and the recycling watermark.

#![allow(non_snake_case)]

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Result;
use utils::lsn::Lsn;

/// Transaction log page size in bytes
pub const XLOG_BLCKSZ: u32 = 8192;

/// Default WAL segment size
pub const WAL_SEG_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum WAL bytes shipped in one CopyData frame
pub const MAX_SEND_SIZE: u32 = XLOG_BLCKSZ * 16;

pub type TimestampTz = i64;

/// Seconds between the Unix epoch and 2000-01-01, the WAL timestamp epoch.
const UNIX_TO_WAL_EPOCH_SECS: u64 = 946_684_800;

/// Current time in microseconds since the WAL epoch.
pub fn get_current_timestamp() -> TimestampTz {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => (n.as_micros() as i64) - (UNIX_TO_WAL_EPOCH_SECS * 1_000_000) as i64,
        Err(_) => 0,
    }
}

/// Size of a logical log file: the largest multiple of the segment size
/// that still fits in 32 bits. The tail of the 4 GiB range holds no
/// segment, which is why positions carry into the next logid early.
pub const fn log_file_size(seg_size: u32) -> u32 {
    (u32::MAX / seg_size) * seg_size
}

/// Name of the segment file holding `(logid, seg)` on the given timeline.
pub fn XLogFileName(tli: u32, logid: u32, seg: u32) -> String {
    format!("{:08X}{:08X}{:08X}", tli, logid, seg)
}

/// Does this look like a WAL segment file name?
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == 24 && fname.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a segment file name into `(tli, logid, seg)`.
pub fn XLogFromFileName(fname: &str) -> Option<(u32, u32, u32)> {
    if !IsXLogFileName(fname) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let logid = u32::from_str_radix(&fname[8..16], 16).ok()?;
    let seg = u32::from_str_radix(&fname[16..24], 16).ok()?;
    Some((tli, logid, seg))
}

/// Position of the first byte of segment `(logid, seg)`.
pub fn segment_start(logid: u32, seg: u32, seg_size: u32) -> Lsn {
    Lsn::new(logid, seg * seg_size)
}

/// Position one past the last byte of segment `(logid, seg)`.
pub fn segment_end(logid: u32, seg: u32, seg_size: u32) -> Lsn {
    segment_start(logid, seg, seg_size).advance(seg_size as u64, log_file_size(seg_size))
}

/// Scan the WAL directory for the newest complete segment on the given
/// timeline and return the position just past it. This is where the durable
/// WAL ends when the flusher works in whole segments. Returns `Lsn::ZERO`
/// for an empty (or missing) directory.
pub fn find_end_of_wal(wal_dir: &Path, seg_size: u32, tli: u32) -> Result<Lsn> {
    let mut newest: Option<(u32, u32)> = None;
    let entries = match fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lsn::ZERO),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let fname = entry.file_name();
        let fname = match fname.to_str() {
            Some(s) => s,
            None => continue,
        };
        let (file_tli, logid, seg) = match XLogFromFileName(fname) {
            Some(parsed) => parsed,
            None => continue,
        };
        if file_tli != tli {
            continue;
        }
        if entry.metadata()?.len() != seg_size as u64 {
            // partial segment, not durable yet
            continue;
        }
        if newest.map_or(true, |cur| (logid, seg) > cur) {
            newest = Some((logid, seg));
        }
    }
    Ok(match newest {
        Some((logid, seg)) => segment_end(logid, seg, seg_size),
        None => Lsn::ZERO,
    })
}

/// Scan the WAL directory for the oldest segment present on the given
/// timeline. Everything below it has been removed or never existed.
pub fn find_oldest_segment(wal_dir: &Path, tli: u32) -> Result<Option<(u32, u32)>> {
    let mut oldest: Option<(u32, u32)> = None;
    let entries = match fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let fname = entry.file_name();
        let fname = match fname.to_str() {
            Some(s) => s,
            None => continue,
        };
        let (file_tli, logid, seg) = match XLogFromFileName(fname) {
            Some(parsed) => parsed,
            None => continue,
        };
        if file_tli != tli {
            continue;
        }
        if oldest.map_or(true, |cur| (logid, seg) < cur) {
            oldest = Some((logid, seg));
        }
    }
    Ok(oldest)
}
