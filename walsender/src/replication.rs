//! The streaming half of the replication protocol: everything that happens
//! after START_REPLICATION switches the connection into copy-both mode.
//!
//! The sender loops shipping batches of flushed WAL. When it has caught up
//! with the flush pointer it parks on its latch (together with the socket,
//! so a standby disconnect wakes it too) until the flusher advances and
//! wakes it. Shutdown is drained through the same loop: TERM ends the
//! stream at the next iteration, USR2 first ships everything outstanding.

use anyhow::{bail, Context, Result};
use tracing::*;
use utils::lsn::Lsn;
use utils::postgres_backend::PostgresBackend;
use utils::pq_proto::{BeMessage, XLogDataBody};
use utils::shutdown::exit_now;

use crate::slots::{SlotHandle, WalSndState};
use crate::system::SystemState;
use crate::wal_reader::WalReader;
use crate::xlog_utils::{get_current_timestamp, log_file_size};
use crate::WalSenderConf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Everything up to the flush pointer has been shipped.
    CaughtUp,
    /// A batch was sent but more flushed WAL remains.
    Behind,
    /// The transport is broken; nothing further can reach the standby.
    PeerGone,
}

pub struct WalSender<'a> {
    pgb: &'a mut PostgresBackend,
    conf: &'a WalSenderConf,
    system: &'a SystemState,
    slot: &'a SlotHandle,

    /// Next position to send. Never ahead of the flush pointer, never moves
    /// backwards.
    sent_ptr: Lsn,
    reader: WalReader,
    send_buf: Vec<u8>,

    /// Set once this sender has drained on USR2; local so one drained
    /// sender does not cut short another that is still behind.
    shutdown_requested: bool,
    seen_config_generation: u64,
}

impl<'a> WalSender<'a> {
    pub fn new(
        pgb: &'a mut PostgresBackend,
        conf: &'a WalSenderConf,
        system: &'a SystemState,
        slot: &'a SlotHandle,
        start_pos: Lsn,
    ) -> WalSender<'a> {
        WalSender {
            pgb,
            conf,
            system,
            slot,
            sent_ptr: start_pos,
            reader: WalReader::new(conf.wal_dir(), conf.timeline, conf.wal_seg_size),
            send_buf: vec![0u8; conf.max_send_size as usize],
            shutdown_requested: false,
            seen_config_generation: system.config_generation(),
        }
    }

    /// Main loop. Returns when the stream is over, whatever the reason;
    /// stream-ending conditions that are not server faults (peer close,
    /// broken transport, graceful shutdown) are not errors.
    pub fn run(mut self) -> Result<()> {
        let peer = *self.pgb.peer_addr();
        info!("streaming WAL to {} from {}", peer, self.sent_ptr);
        self.slot.slot().publish_sent_ptr(self.sent_ptr);

        let mut caughtup = false;
        loop {
            if !self.system.supervisor_alive() {
                exit_now(1);
            }

            self.service_config_reload();

            // Drain request: ship whatever is outstanding, then promote to
            // a regular shutdown once nothing remains.
            if self.system.ready_to_stop() {
                match self.send_batch()? {
                    SendOutcome::PeerGone => break,
                    outcome => {
                        caughtup = outcome == SendOutcome::CaughtUp;
                        if caughtup {
                            self.shutdown_requested = true;
                        }
                    }
                }
            }

            if self.shutdown_requested || self.system.shutdown_requested() {
                // Tell the standby that streaming is done, then leave.
                self.pgb
                    .write_message_noflush(&BeMessage::CommandComplete(b"COPY 0"))?
                    .flush()?;
                info!("WAL sender to {} shut down at {}", peer, self.sent_ptr);
                return Ok(());
            }

            if caughtup {
                // More WAL may have been flushed while the previous batch
                // was in flight, and the latch was set the whole time.
                // Re-arm it first, then look again before sleeping.
                self.slot.slot().latch.reset();
                match self.send_batch()? {
                    SendOutcome::PeerGone => break,
                    outcome => caughtup = outcome == SendOutcome::CaughtUp,
                }
                if caughtup
                    && !self.shutdown_requested
                    && !self.system.signals_pending(self.seen_config_generation)
                {
                    self.slot
                        .slot()
                        .latch
                        .wait_or_socket(self.pgb.socket_fd(), self.conf.wal_snd_delay)
                        .context("wait for new WAL")?;
                }
                if !self.check_closed_connection()? {
                    info!("standby {} closed the connection", peer);
                    return Ok(());
                }
            } else {
                match self.send_batch()? {
                    SendOutcome::PeerGone => break,
                    outcome => caughtup = outcome == SendOutcome::CaughtUp,
                }
            }

            self.slot.slot().set_state(if caughtup {
                WalSndState::Streaming
            } else {
                WalSndState::Catchup
            });
        }

        // Send failure. The standby is expected to reconnect, which spawns
        // a fresh sender.
        info!("connection to standby {} is gone, stopping", peer);
        Ok(())
    }

    /// Ship one batch of WAL, at most `max_send_size` bytes and never past
    /// the current flush pointer.
    ///
    /// The batch is cut at the segment boundary, and short of the flush
    /// pointer it is rounded down to a page boundary. The standby relies on
    /// no WAL record being split across two messages: long records continue
    /// on page boundaries, segments are page multiples, and the flush
    /// pointer itself is a record boundary (the flusher's contract).
    pub fn send_batch(&mut self) -> Result<SendOutcome> {
        // Only flushed WAL may be shipped: the standby must never hold
        // bytes the primary could lose in a crash.
        let flush_ptr = self.system.get_flush_ptr();
        if flush_ptr <= self.sent_ptr {
            return Ok(SendOutcome::CaughtUp);
        }

        let lfs = log_file_size(self.conf.wal_seg_size);
        let mut startptr = self.sent_ptr;
        if startptr.recoff >= lfs {
            // The tail of a logical log file holds no segment; skip into
            // the next one.
            startptr = Lsn::new(startptr.logid + 1, 0);
        }

        let within = startptr.segment_offset(self.conf.wal_seg_size);
        let batch = self
            .conf
            .max_send_size
            .min(self.conf.wal_seg_size - within);
        let mut endptr = Lsn::new(startptr.logid, startptr.recoff + batch);

        let caughtup;
        if flush_ptr <= endptr {
            endptr = flush_ptr;
            caughtup = true;
        } else {
            endptr.recoff -= endptr.recoff % self.conf.wal_page_size;
            caughtup = false;
        }

        let nbytes = (endptr.recoff - startptr.recoff) as usize;
        assert!(nbytes <= self.conf.max_send_size as usize);

        let send_buf = &mut self.send_buf[..nbytes];
        self.reader.read(startptr, send_buf, self.system)?;

        // The header is built last so the send timestamp is as fresh as
        // possible.
        let msg = BeMessage::XLogData(XLogDataBody {
            wal_start: startptr.into(),
            wal_end: flush_ptr.into(),
            timestamp: get_current_timestamp(),
            data: send_buf,
        });
        let sent = self
            .pgb
            .write_message_noflush(&msg)
            .and_then(|pgb| pgb.flush().map(|_| ()));
        if let Err(e) = sent {
            info!("failed to send WAL to {}: {}", self.pgb.peer_addr(), e);
            return Ok(SendOutcome::PeerGone);
        }

        self.sent_ptr = endptr;
        self.slot.slot().publish_sent_ptr(endptr);

        if self.conf.update_process_title {
            debug!("streaming {}", endptr);
        }

        Ok(if caughtup {
            SendOutcome::CaughtUp
        } else {
            SendOutcome::Behind
        })
    }

    /// Non-blocking look at the inbound side of the stream. Returns false
    /// when the standby has closed the connection (`X` or EOF); anything
    /// else it may send mid-stream is a protocol violation.
    fn check_closed_connection(&mut self) -> Result<bool> {
        match self.pgb.get_byte_if_available() {
            Ok(None) => Ok(true),
            Ok(Some(b'X')) => Ok(false),
            Ok(Some(byte)) => bail!("invalid standby closing message type {}", byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("unexpected EOF on standby connection");
                Ok(false)
            }
            Err(e) => Err(e).context("failed to poll standby connection"),
        }
    }

    fn service_config_reload(&mut self) {
        let generation = self.system.config_generation();
        if generation != self.seen_config_generation {
            self.seen_config_generation = generation;
            // Configuration comes from the embedding server; acknowledge
            // and continue with current values.
            info!("configuration reload requested");
        }
    }
}
