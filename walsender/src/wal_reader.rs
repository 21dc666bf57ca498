//! Reading flushed WAL back off disk for shipping.
//!
//! The reader keeps at most one segment file open and remembers where its
//! cursor is, so the common case of streaming sequentially through a
//! segment costs neither an open nor a seek per batch.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::*;
use utils::lsn::Lsn;

use crate::system::SystemState;
use crate::xlog_utils::{log_file_size, XLogFileName};

#[derive(Debug, thiserror::Error)]
pub enum WalReadError {
    /// The standby fell behind far enough that the segment it needs has
    /// been recycled. It must restart replication from a retained position.
    #[error("requested WAL segment {0} has already been removed")]
    SegmentGone(String),

    #[error("could not open file \"{path}\" (log file {logid}, segment {seg}): {source}")]
    Open {
        path: String,
        logid: u32,
        seg: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not seek in log file {logid}, segment {seg} to offset {offset}: {source}")]
    Seek {
        logid: u32,
        seg: u32,
        offset: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not read from log file {logid}, segment {seg}, offset {offset}, length {len}: {source}")]
    Read {
        logid: u32,
        seg: u32,
        offset: u32,
        len: usize,
        #[source]
        source: io::Error,
    },
}

pub struct WalReader {
    wal_dir: PathBuf,
    timeline: u32,
    seg_size: u32,

    // Cached open segment and position within it.
    file: Option<File>,
    send_logid: u32,
    send_seg: u32,
    send_off: u32,
}

impl WalReader {
    pub fn new(wal_dir: PathBuf, timeline: u32, seg_size: u32) -> WalReader {
        WalReader {
            wal_dir,
            timeline,
            seg_size,
            file: None,
            send_logid: 0,
            send_seg: 0,
            send_off: 0,
        }
    }

    /// Fill `buf` with the WAL bytes starting at `startptr`.
    ///
    /// On success the bytes are guaranteed to come from segments that had
    /// not been recycled when the read completed: opening a segment proves
    /// it was present, and the watermark check afterwards proves recycling
    /// did not overwrite it mid-read. Both checks are needed because
    /// recycling is silent; a read from a recycled file still succeeds.
    pub fn read(
        &mut self,
        startptr: Lsn,
        buf: &mut [u8],
        system: &SystemState,
    ) -> Result<(), WalReadError> {
        let mut pos = startptr;
        let mut filled = 0usize;

        while filled < buf.len() {
            let within = pos.segment_offset(self.seg_size);
            let logid = pos.logid;
            let seg = pos.segment_number(self.seg_size);

            if self.file.is_none() || (logid, seg) != (self.send_logid, self.send_seg) {
                // Switch to another logfile segment.
                self.file = Some(self.open_segment(logid, seg)?);
                self.send_logid = logid;
                self.send_seg = seg;
                self.send_off = 0;
            }
            let file = self.file.as_mut().unwrap();

            if self.send_off != within {
                file.seek(SeekFrom::Start(within as u64))
                    .map_err(|source| WalReadError::Seek {
                        logid,
                        seg,
                        offset: within,
                        source,
                    })?;
                self.send_off = within;
            }

            let segbytes = (buf.len() - filled).min((self.seg_size - within) as usize);
            let readbytes = file
                .read(&mut buf[filled..filled + segbytes])
                .map_err(|source| WalReadError::Read {
                    logid,
                    seg,
                    offset: self.send_off,
                    len: segbytes,
                    source,
                })?;
            if readbytes == 0 {
                return Err(WalReadError::Read {
                    logid,
                    seg,
                    offset: self.send_off,
                    len: segbytes,
                    source: io::ErrorKind::UnexpectedEof.into(),
                });
            }

            pos = pos.advance(readbytes as u64, log_file_size(self.seg_size));
            self.send_off += readbytes as u32;
            filled += readbytes;
        }

        // The segment was present when we opened it, but it may have been
        // recycled while we were reading; in that case the buffer now holds
        // newer WAL. Check the watermark published by the recycler.
        if let Some((last_logid, last_seg)) = system.last_removed_segment() {
            let start_logid = startptr.logid;
            let start_seg = startptr.segment_number(self.seg_size);
            if (start_logid, start_seg) <= (last_logid, last_seg) {
                return Err(WalReadError::SegmentGone(XLogFileName(
                    self.timeline,
                    start_logid,
                    start_seg,
                )));
            }
        }

        Ok(())
    }

    fn open_segment(&self, logid: u32, seg: u32) -> Result<File, WalReadError> {
        let fname = XLogFileName(self.timeline, logid, seg);
        let path = self.wal_dir.join(&fname);
        match File::open(&path) {
            Ok(file) => Ok(file),
            // Not found means the standby asked for WAL old enough to have
            // been removed already.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(WalReadError::SegmentGone(fname))
            }
            Err(source) => {
                warn!("failed to open WAL segment {:?}: {}", path, source);
                Err(WalReadError::Open {
                    path: path.display().to_string(),
                    logid,
                    seg,
                    source,
                })
            }
        }
    }
}
