//! The shared sender slot table.
//!
//! A fixed array of slots, sized by `max_wal_senders`, advertises every
//! live sender's progress to the rest of the server. Each slot carries an
//! atomic owner pid (0 means free), a small mutex window over the published
//! `(sent_ptr, state)` pair, and the sender's wake latch. There is no table
//! lock: slot claims go through a compare-exchange on the pid, and readers
//! take slots one at a time, so consistency is per-slot only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use utils::latch::Latch;
use utils::lsn::Lsn;

/// Advertised state of one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSndState {
    Startup,
    Backup,
    Catchup,
    Streaming,
}

impl WalSndState {
    /// Used in monitoring output; not subject to translation.
    pub fn as_str(self) -> &'static str {
        match self {
            WalSndState::Startup => "STARTUP",
            WalSndState::Backup => "BACKUP",
            WalSndState::Catchup => "CATCHUP",
            WalSndState::Streaming => "STREAMING",
        }
    }
}

#[derive(Debug)]
struct WalSndShared {
    sent_ptr: Lsn,
    state: WalSndState,
}

/// One advertising slot.
#[derive(Debug)]
pub struct WalSnd {
    /// Owning connection id; 0 means the slot is free. Claimed with a
    /// compare-exchange, released with a plain store (only the owner and
    /// nobody else ever writes a nonzero value here).
    pid: AtomicU32,
    /// sent_ptr and state share one lock window so monitoring never sees
    /// them torn apart.
    shared: Mutex<WalSndShared>,
    pub latch: Latch,
}

impl WalSnd {
    fn new() -> anyhow::Result<WalSnd> {
        Ok(WalSnd {
            pid: AtomicU32::new(0),
            shared: Mutex::new(WalSndShared {
                sent_ptr: Lsn::ZERO,
                state: WalSndState::Startup,
            }),
            latch: Latch::new()?,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Publish how far this sender has shipped.
    pub fn publish_sent_ptr(&self, sent_ptr: Lsn) {
        let mut shared = self.shared.lock().unwrap();
        shared.sent_ptr = sent_ptr;
    }

    /// Publish the sender state. No-op if unchanged.
    pub fn set_state(&self, state: WalSndState) {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != state {
            shared.state = state;
        }
    }

    /// Consistent snapshot of the published pair.
    pub fn snapshot(&self) -> (Lsn, WalSndState) {
        let shared = self.shared.lock().unwrap();
        (shared.sent_ptr, shared.state)
    }
}

/// Monitoring row for one live sender.
#[derive(Debug, Clone, Serialize)]
pub struct WalSndRow {
    pub pid: u32,
    pub state: &'static str,
    pub sent_ptr: String,
}

/// The slot table itself.
#[derive(Debug)]
pub struct WalSndCtl {
    slots: Box<[WalSnd]>,
}

#[derive(Debug, thiserror::Error)]
#[error("number of requested standby connections exceeds max_wal_senders (currently {max_wal_senders})")]
pub struct TooManySenders {
    pub max_wal_senders: usize,
}

impl WalSndCtl {
    pub fn new(max_wal_senders: usize) -> anyhow::Result<WalSndCtl> {
        let mut slots = Vec::with_capacity(max_wal_senders);
        for _ in 0..max_wal_senders {
            slots.push(WalSnd::new()?);
        }
        Ok(WalSndCtl {
            slots: slots.into_boxed_slice(),
        })
    }

    /// Claim the first free slot for `pid`. The returned handle releases
    /// the slot when dropped, whatever path the sender exits through.
    pub fn allocate(self: &Arc<Self>, pid: u32) -> Result<SlotHandle, TooManySenders> {
        assert!(pid != 0);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .pid
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            {
                let mut shared = slot.shared.lock().unwrap();
                shared.sent_ptr = Lsn::ZERO;
                shared.state = WalSndState::Startup;
            }
            slot.latch.own();
            slot.latch.reset();
            return Ok(SlotHandle {
                ctl: Arc::clone(self),
                index,
            });
        }
        Err(TooManySenders {
            max_wal_senders: self.slots.len(),
        })
    }

    /// Wake every sender. Latch set is idempotent and safe concurrently, so
    /// no locks are taken; waking a free slot's latch is harmless.
    pub fn wake_all(&self) {
        for slot in self.slots.iter() {
            slot.latch.set();
        }
    }

    /// How many slots are currently claimed.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.pid() != 0).count()
    }

    /// Materialize monitoring rows for every live sender.
    pub fn senders(&self) -> Vec<WalSndRow> {
        let mut rows = Vec::new();
        for slot in self.slots.iter() {
            let pid = slot.pid();
            if pid == 0 {
                continue;
            }
            let (sent_ptr, state) = slot.snapshot();
            rows.push(WalSndRow {
                pid,
                state: state.as_str(),
                sent_ptr: sent_ptr.to_string(),
            });
        }
        rows
    }
}

/// Owned claim on one slot.
#[derive(Debug)]
pub struct SlotHandle {
    ctl: Arc<WalSndCtl>,
    index: usize,
}

impl SlotHandle {
    pub fn slot(&self) -> &WalSnd {
        &self.ctl.slots[self.index]
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let slot = self.slot();
        slot.latch.disown();
        // No lock needed: nobody else writes pid for a claimed slot.
        slot.pid.store(0, Ordering::Release);
    }
}
