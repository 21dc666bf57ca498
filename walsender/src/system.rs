//! Process-wide control state shared between senders, the signal thread and
//! the embedding server.
//!
//! Every field is a single-writer atomic word: the flush pointer and the
//! last-removed watermark are advanced by the flusher side, the flags by the
//! signal thread, and senders only read them. None of this needs a lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use utils::lsn::{AtomicLsn, Lsn};

/// Sentinel for "no segment has been removed yet".
const NO_SEGMENT_REMOVED: u64 = u64::MAX;

pub struct SystemState {
    system_id: u64,
    timeline: u32,

    /// Highest position whose bytes are known durable. Senders never ship
    /// past it.
    flush_ptr: AtomicLsn,

    /// `(logid, seg)` of the newest recycled segment, packed into one word.
    last_removed: AtomicU64,

    in_recovery: AtomicBool,
    supervisor_alive: AtomicBool,

    // Signal-driven flags. shutdown/drain are monotone; config reload is a
    // generation counter so that every sender services every reload.
    shutdown_requested: AtomicBool,
    ready_to_stop: AtomicBool,
    config_generation: AtomicU64,
}

impl SystemState {
    pub fn new(system_id: u64, timeline: u32) -> SystemState {
        SystemState {
            system_id,
            timeline,
            flush_ptr: AtomicLsn::new(Lsn::ZERO),
            last_removed: AtomicU64::new(NO_SEGMENT_REMOVED),
            in_recovery: AtomicBool::new(false),
            supervisor_alive: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            ready_to_stop: AtomicBool::new(false),
            config_generation: AtomicU64::new(0),
        }
    }

    pub fn system_id(&self) -> u64 {
        self.system_id
    }

    pub fn timeline(&self) -> u32 {
        self.timeline
    }

    pub fn get_flush_ptr(&self) -> Lsn {
        self.flush_ptr.load()
    }

    /// Advance the flush pointer. Regressions are ignored; the pointer is
    /// monotonic by contract.
    pub fn advance_flush_ptr(&self, lsn: Lsn) -> Lsn {
        self.flush_ptr.fetch_max(lsn)
    }

    pub fn last_removed_segment(&self) -> Option<(u32, u32)> {
        match self.last_removed.load(Ordering::Acquire) {
            NO_SEGMENT_REMOVED => None,
            word => Some(((word >> 32) as u32, word as u32)),
        }
    }

    /// Single writer: the segment recycler. Values only move forward.
    pub fn set_last_removed_segment(&self, logid: u32, seg: u32) {
        let word = ((logid as u64) << 32) | seg as u64;
        self.last_removed.store(word, Ordering::Release);
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    pub fn set_in_recovery(&self, value: bool) {
        self.in_recovery.store(value, Ordering::Release);
    }

    pub fn supervisor_alive(&self) -> bool {
        self.supervisor_alive.load(Ordering::Acquire)
    }

    pub fn supervisor_died(&self) {
        self.supervisor_alive.store(false, Ordering::Release);
    }

    /// TERM: close the stream and exit at the next convenient point.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// USR2: drain outstanding WAL, then shut down.
    pub fn request_stop_after_drain(&self) {
        self.ready_to_stop.store(true, Ordering::Release);
    }

    pub fn ready_to_stop(&self) -> bool {
        self.ready_to_stop.load(Ordering::Acquire)
    }

    /// HUP: ask every sender to re-read configuration.
    pub fn request_config_reload(&self) {
        self.config_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn config_generation(&self) -> u64 {
        self.config_generation.load(Ordering::Acquire)
    }

    /// Any flag a caught-up sender should handle before going to sleep?
    pub fn signals_pending(&self, seen_config_generation: u64) -> bool {
        self.shutdown_requested()
            || self.ready_to_stop()
            || self.config_generation() != seen_config_generation
    }
}
