//! WAL streaming sender: the part of a primary server that ships flushed
//! WAL to connected standbys over the replication flavor of the Postgres
//! wire protocol. One sender runs per standby connection; senders
//! coordinate only through the shared slot table in [`slots`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context};
use strum_macros::{EnumString, EnumVariantNames};

use crate::xlog_utils::{MAX_SEND_SIZE, WAL_SEG_SIZE, XLOG_BLCKSZ};

pub mod basebackup;
pub mod replication;
pub mod send_wal;
pub mod slots;
pub mod system;
pub mod wal_reader;
pub mod wal_service;
pub mod xlog_utils;

/// Name of the file holding the persisted system identifier. It lives in
/// the data directory but is private to this server: base backups must not
/// carry it to a standby.
pub const SYSTEM_ID_FILE_NAME: &str = "walsender.systemid";

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_PG_LISTEN_PORT: u16 = 5454;
    pub const DEFAULT_PG_LISTEN_ADDR: &str = "127.0.0.1:5454";

    pub const DEFAULT_MAX_WAL_SENDERS: usize = 8;

    /// Periodic wake while caught up. The latch wakes us as soon as new WAL
    /// is flushed; the tick is a safety net, not a correctness mechanism.
    pub const DEFAULT_WAL_SND_DELAY: Duration = Duration::from_millis(200);
}

/// How much information the primary writes into its WAL. Log shipping needs
/// more than `minimal`.
#[derive(EnumString, EnumVariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum WalLevel {
    Minimal,
    Archive,
    HotStandby,
}

impl WalLevel {
    pub fn from_config(s: &str) -> anyhow::Result<WalLevel> {
        use strum::VariantNames;
        WalLevel::from_str(s).with_context(|| {
            format!(
                "Unrecognized wal_level. Please specify one of: {:?}",
                WalLevel::VARIANTS
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct WalSenderConf {
    /// Server data directory; WAL segments live in `pg_wal` under it.
    pub data_dir: PathBuf,
    pub listen_pg_addr: String,
    /// Sizes the shared slot table.
    pub max_wal_senders: usize,
    pub wal_snd_delay: Duration,
    pub wal_level: WalLevel,
    /// Report streaming progress once per sent batch.
    pub update_process_title: bool,
    pub timeline: u32,
    pub wal_seg_size: u32,
    pub wal_page_size: u32,
    pub max_send_size: u32,
}

impl WalSenderConf {
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("pg_wal")
    }

    pub fn system_id_path(&self) -> PathBuf {
        self.data_dir.join(SYSTEM_ID_FILE_NAME)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.wal_seg_size.is_power_of_two(),
            "wal segment size must be a power of two"
        );
        ensure!(
            self.wal_page_size.is_power_of_two(),
            "wal page size must be a power of two"
        );
        ensure!(
            self.wal_seg_size % self.wal_page_size == 0,
            "wal segment size must be a multiple of the page size"
        );
        ensure!(
            self.max_send_size >= self.wal_page_size,
            "max send size must cover at least one wal page"
        );
        ensure!(self.max_wal_senders > 0, "max_wal_senders must be positive");
        Ok(())
    }
}

impl Default for WalSenderConf {
    fn default() -> Self {
        WalSenderConf {
            data_dir: PathBuf::from("./"),
            listen_pg_addr: defaults::DEFAULT_PG_LISTEN_ADDR.to_string(),
            max_wal_senders: defaults::DEFAULT_MAX_WAL_SENDERS,
            wal_snd_delay: defaults::DEFAULT_WAL_SND_DELAY,
            wal_level: WalLevel::HotStandby,
            update_process_title: true,
            timeline: 1,
            wal_seg_size: WAL_SEG_SIZE,
            wal_page_size: XLOG_BLCKSZ,
            max_send_size: MAX_SEND_SIZE,
        }
    }
}
