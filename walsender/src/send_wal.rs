//! Command handshake: the request/response phase a replication connection
//! goes through before streaming starts.
//!
//! Exactly one command is consumed per round: `IDENTIFY_SYSTEM` and
//! `BASE_BACKUP` answer and loop for the next command, `START_REPLICATION`
//! leaves the handshake for the streaming loop and never comes back.

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::*;
use utils::lsn::Lsn;
use utils::postgres_backend::PostgresBackend;
use utils::pq_proto::{cstr_to_str, BeMessage, FeMessage, RowDescriptor, INT4_OID, TEXT_OID};
use utils::shutdown::exit_now;

use crate::basebackup::{self, BaseBackupOptions};
use crate::replication::WalSender;
use crate::slots::{SlotHandle, WalSndState};
use crate::system::SystemState;
use crate::{WalLevel, WalSenderConf};

/// Parsed replication command.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplicationCommand {
    IdentifySystem,
    StartReplication { start_pos: Lsn },
    BaseBackup(BaseBackupOptions),
}

static START_REPLICATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^START_REPLICATION\s+([[:xdigit:]]+/[[:xdigit:]]+)\s*$").unwrap());
static BASE_BACKUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^BASE_BACKUP(?:\s+LABEL\s+'([^']*)')?(?:\s+(PROGRESS))?(?:\s+(FAST))?\s*$")
        .unwrap()
});

/// Parse one replication command. Anything unrecognized is an error, and
/// the dispatcher treats that as a fatal protocol violation: commands are
/// never silently skipped.
pub fn parse_replication_command(cmd: &str) -> Result<ReplicationCommand> {
    if cmd.starts_with("IDENTIFY_SYSTEM") {
        Ok(ReplicationCommand::IdentifySystem)
    } else if cmd.starts_with("START_REPLICATION") {
        let caps = START_REPLICATION_RE
            .captures(cmd)
            .ok_or_else(|| anyhow!("invalid START_REPLICATION command: {:?}", cmd))?;
        let start_pos = caps[1]
            .parse::<Lsn>()
            .context("failed to parse start position from START_REPLICATION command")?;
        Ok(ReplicationCommand::StartReplication { start_pos })
    } else if cmd.starts_with("BASE_BACKUP") {
        let caps = BASE_BACKUP_RE
            .captures(cmd)
            .ok_or_else(|| anyhow!("invalid BASE_BACKUP command: {:?}", cmd))?;
        Ok(ReplicationCommand::BaseBackup(BaseBackupOptions {
            label: caps.get(1).map(|m| m.as_str().to_owned()),
            progress: caps.get(2).is_some(),
            fast: caps.get(3).is_some(),
        }))
    } else {
        bail!("invalid standby query string: {:?}", cmd)
    }
}

/// Per-connection command handler.
pub struct SendWalHandler<'a> {
    conf: &'a WalSenderConf,
    system: &'a SystemState,
    slot: &'a SlotHandle,
    pub appname: Option<String>,
}

impl<'a> SendWalHandler<'a> {
    pub fn new(
        conf: &'a WalSenderConf,
        system: &'a SystemState,
        slot: &'a SlotHandle,
        appname: Option<String>,
    ) -> SendWalHandler<'a> {
        SendWalHandler {
            conf,
            system,
            slot,
            appname,
        }
    }

    /// Execute commands from the standby until streaming starts or the
    /// standby goes away.
    pub fn run(mut self, pgb: &mut PostgresBackend) -> Result<()> {
        let mut seen_config_generation = self.system.config_generation();
        loop {
            self.slot.slot().set_state(WalSndState::Startup);

            let msg = pgb.read_message()?;

            // Events that happened while we were waiting for a command.
            if !self.system.supervisor_alive() {
                exit_now(1);
            }
            let generation = self.system.config_generation();
            if generation != seen_config_generation {
                seen_config_generation = generation;
                info!("configuration reload requested");
            }

            match msg {
                Some(FeMessage::Query(body)) => {
                    let query = cstr_to_str(&body)?;
                    debug!("received replication command: {:?}", query);
                    match parse_replication_command(query)? {
                        ReplicationCommand::IdentifySystem => {
                            self.handle_identify_system(pgb)?;
                        }
                        ReplicationCommand::BaseBackup(opts) => {
                            self.slot.slot().set_state(WalSndState::Backup);
                            basebackup::send_base_backup(pgb, self.conf, &opts)?;
                            pgb.write_message_noflush(&BeMessage::CommandComplete(b"SELECT"))?
                                .write_message(&BeMessage::ReadyForQuery)?;
                        }
                        ReplicationCommand::StartReplication { start_pos } => {
                            // The slot claimed at init is this connection's
                            // standing as a WAL sender; from here on it may
                            // only ship WAL, not produce it, and it exits
                            // when the stream ends.
                            if self.conf.wal_level == WalLevel::Minimal {
                                bail!(
                                    "standby connections not allowed because wal_level=minimal"
                                );
                            }
                            if let Some(appname) = &self.appname {
                                info!("standby {} requested streaming from {}", appname, start_pos);
                            }
                            pgb.write_message(&BeMessage::CopyBothResponse)?;
                            return WalSender::new(
                                pgb,
                                self.conf,
                                self.system,
                                self.slot,
                                start_pos,
                            )
                            .run();
                        }
                    }
                }
                Some(FeMessage::Terminate) => {
                    // standby is closing the connection
                    return Ok(());
                }
                None => {
                    info!("unexpected EOF on standby connection");
                    return Ok(());
                }
                Some(other) => {
                    bail!("invalid standby handshake message type {:?}", other);
                }
            }
        }
    }

    /// Reply with one row of two columns: system identifier and timeline.
    fn handle_identify_system(&mut self, pgb: &mut PostgresBackend) -> Result<()> {
        let sysid = self.system.system_id().to_string();
        let tli = self.system.timeline().to_string();

        pgb.write_message_noflush(&BeMessage::RowDescription(&[
            RowDescriptor {
                name: b"systemid",
                typoid: TEXT_OID,
                typlen: -1,
                ..Default::default()
            },
            RowDescriptor {
                name: b"timeline",
                typoid: INT4_OID,
                typlen: 4,
                ..Default::default()
            },
        ]))?
        .write_message_noflush(&BeMessage::DataRow(&[
            Some(sysid.as_bytes()),
            Some(tli.as_bytes()),
        ]))?
        .write_message_noflush(&BeMessage::CommandComplete(b"SELECT"))?
        .write_message(&BeMessage::ReadyForQuery)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identify_system() {
        assert_eq!(
            parse_replication_command("IDENTIFY_SYSTEM").unwrap(),
            ReplicationCommand::IdentifySystem
        );
    }

    #[test]
    fn parse_start_replication() {
        assert_eq!(
            parse_replication_command("START_REPLICATION 0/16B9188").unwrap(),
            ReplicationCommand::StartReplication {
                start_pos: Lsn::new(0, 0x16B9188)
            }
        );
        assert_eq!(
            parse_replication_command("START_REPLICATION A/0").unwrap(),
            ReplicationCommand::StartReplication {
                start_pos: Lsn::new(10, 0)
            }
        );
        parse_replication_command("START_REPLICATION").unwrap_err();
        parse_replication_command("START_REPLICATION banana").unwrap_err();
    }

    #[test]
    fn parse_base_backup() {
        assert_eq!(
            parse_replication_command("BASE_BACKUP").unwrap(),
            ReplicationCommand::BaseBackup(BaseBackupOptions {
                label: None,
                progress: false,
                fast: false,
            })
        );
        assert_eq!(
            parse_replication_command("BASE_BACKUP LABEL 'nightly' PROGRESS FAST").unwrap(),
            ReplicationCommand::BaseBackup(BaseBackupOptions {
                label: Some("nightly".to_owned()),
                progress: true,
                fast: true,
            })
        );
        assert_eq!(
            parse_replication_command("BASE_BACKUP FAST").unwrap(),
            ReplicationCommand::BaseBackup(BaseBackupOptions {
                label: None,
                progress: false,
                fast: true,
            })
        );
        parse_replication_command("BASE_BACKUP LABEL unquoted").unwrap_err();
    }

    #[test]
    fn unknown_command_is_an_error() {
        parse_replication_command("SELECT 1").unwrap_err();
        parse_replication_command("").unwrap_err();
    }
}
