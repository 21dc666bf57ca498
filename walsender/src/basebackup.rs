//! BASE_BACKUP: stream the data directory to the standby as a tarball
//! wrapped in CopyData messages.
//!
//! WAL segments are not included (the standby fetches those over the
//! replication stream, starting from a position it learns out of band),
//! and neither are files private to this server, like the persisted
//! system identifier.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::*;
use utils::postgres_backend::{CopyDataWriter, PostgresBackend};
use utils::pq_proto::BeMessage;

use crate::WalSenderConf;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BaseBackupOptions {
    pub label: Option<String>,
    pub progress: bool,
    /// Ask for a fast checkpoint before the backup. Checkpointing belongs
    /// to the flusher side; the option is accepted and recorded.
    pub fast: bool,
}

/// Entry point invoked from the command handshake.
pub fn send_base_backup(
    pgb: &mut PostgresBackend,
    conf: &WalSenderConf,
    opts: &BaseBackupOptions,
) -> Result<()> {
    let label = opts.label.as_deref().unwrap_or("base backup");
    info!(
        "starting base backup \"{}\" of {}{}",
        label,
        conf.data_dir.display(),
        if opts.fast { " (fast checkpoint requested)" } else { "" },
    );

    let excluded = Excluded {
        wal_dir: conf.wal_dir(),
        system_id_path: conf.system_id_path(),
    };

    if opts.progress {
        let total = directory_size(&conf.data_dir, &excluded)?;
        info!("base backup \"{}\": {} bytes to send", label, total);
    }

    pgb.write_message(&BeMessage::CopyOutResponse)?;
    {
        let writer = CopyDataWriter::new(pgb);
        let mut ar = tar::Builder::new(writer);
        append_dir_contents(&mut ar, &conf.data_dir, &conf.data_dir, &excluded)
            .context("failed to archive data directory")?;
        let mut writer = ar.into_inner()?;
        writer.flush()?;
    }
    pgb.write_message(&BeMessage::CopyDone)?;

    info!("base backup \"{}\" complete", label);
    Ok(())
}

/// What a backup must not carry: WAL segments travel over the replication
/// stream instead, and the system-identity file belongs to this server
/// alone (a standby restoring it would impersonate the primary).
struct Excluded {
    wal_dir: PathBuf,
    system_id_path: PathBuf,
}

impl Excluded {
    fn file(&self, path: &Path) -> bool {
        path == self.system_id_path
    }
}

fn append_dir_contents<W: Write>(
    ar: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    excluded: &Excluded,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = path
            .strip_prefix(root)
            .expect("walked path is under the root");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            ar.append_dir(name, &path)?;
            // The WAL directory travels as an empty directory entry.
            if path != excluded.wal_dir {
                append_dir_contents(ar, root, &path, excluded)?;
            }
        } else if file_type.is_file() {
            if excluded.file(&path) {
                debug!("skipping server-private file {:?}", path);
                continue;
            }
            ar.append_path_with_name(&path, name)?;
        } else {
            debug!("skipping special file {:?}", path);
        }
    }
    Ok(())
}

fn directory_size(dir: &Path, excluded: &Excluded) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if path != excluded.wal_dir {
                total += directory_size(&path, excluded)?;
            }
        } else if file_type.is_file() && !excluded.file(&path) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
