//
// Main entry point for the walsender executable
//
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::*;

use utils::logging::{self, LogFormat};
use utils::shutdown::exit_now;
use utils::signals::{self, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use utils::tcp_listener;

use walsender::defaults::{DEFAULT_MAX_WAL_SENDERS, DEFAULT_PG_LISTEN_ADDR};
use walsender::slots::WalSndCtl;
use walsender::system::SystemState;
use walsender::wal_service;
use walsender::xlog_utils::{find_end_of_wal, find_oldest_segment, log_file_size, WAL_SEG_SIZE};
use walsender::{WalLevel, WalSenderConf};

const ABOUT: &str = r#"
Ships flushed WAL to connected standby servers over the replication
protocol, one sender per standby connection. An external flusher writes
segments into <datadir>/pg_wal and signals SIGUSR1 when new WAL is durable.
"#;

#[derive(Parser)]
#[command(name = "walsender", about = ABOUT, long_about = None, version)]
struct Args {
    /// Path to the server data directory.
    #[arg(short = 'D', long, default_value = "./")]
    datadir: PathBuf,
    /// System identifier reported to standbys. Minted and persisted on
    /// first start if not given.
    #[arg(long)]
    system_id: Option<u64>,
    /// Initialize the data directory and system identifier, then exit.
    #[arg(long)]
    init: bool,
    /// Listen endpoint for replication connections in the form host:port.
    #[arg(short, long, default_value = DEFAULT_PG_LISTEN_ADDR)]
    listen_pg: String,
    /// Maximum number of concurrent standby connections.
    #[arg(long, default_value_t = DEFAULT_MAX_WAL_SENDERS)]
    max_wal_senders: usize,
    /// Periodic wake interval for caught-up senders.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "200ms")]
    wal_sender_delay: Duration,
    /// WAL detail level; must be above 'minimal' for streaming.
    #[arg(long, default_value = "hot_standby")]
    wal_level: String,
    /// WAL segment size in bytes.
    #[arg(long, default_value_t = WAL_SEG_SIZE)]
    wal_seg_size: u32,
    /// Timeline served by this primary.
    #[arg(long, default_value_t = 1)]
    timeline: u32,
    /// Report per-batch streaming progress.
    #[arg(long, default_value = "true", action = ArgAction::Set)]
    update_process_title: bool,
    /// Format for logging, either 'plain' or 'json'.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(LogFormat::from_config(&args.log_format)?, "info")?;

    let conf = WalSenderConf {
        data_dir: args.datadir,
        listen_pg_addr: args.listen_pg,
        max_wal_senders: args.max_wal_senders,
        wal_snd_delay: args.wal_sender_delay,
        wal_level: WalLevel::from_config(&args.wal_level)?,
        update_process_title: args.update_process_title,
        timeline: args.timeline,
        wal_seg_size: args.wal_seg_size,
        ..Default::default()
    };
    conf.validate()?;

    fs::create_dir_all(conf.wal_dir())
        .with_context(|| format!("failed to create WAL directory {:?}", conf.wal_dir()))?;

    let system_id = set_system_id(&conf.system_id_path(), args.system_id)?;
    if args.init {
        return Ok(());
    }

    let system = Arc::new(SystemState::new(system_id, conf.timeline));
    refresh_wal_state(&conf, &system)?;
    info!(
        "system {} timeline {}, WAL ends at {}",
        system_id,
        conf.timeline,
        system.get_flush_ptr()
    );

    let ctl = Arc::new(WalSndCtl::new(conf.max_wal_senders)?);

    start_signal_thread(conf.clone(), Arc::clone(&system), Arc::clone(&ctl))?;

    let listener = tcp_listener::bind(conf.listen_pg_addr.clone()).map_err(|e| {
        error!("failed to bind to address {}: {}", conf.listen_pg_addr, e);
        e
    })?;

    wal_service::thread_main(Arc::new(conf), system, ctl, listener)
}

/// Determine the system identifier: read the id file if present, otherwise
/// persist the given or a freshly minted one.
fn set_system_id(id_file_path: &Path, given: Option<u64>) -> Result<u64> {
    match fs::read(id_file_path) {
        Ok(content) => {
            let system_id: u64 = std::str::from_utf8(&content)
                .context("failed to parse system id")?
                .trim()
                .parse()
                .context("failed to parse system id")?;
            if let Some(given) = given {
                if given != system_id {
                    bail!(
                        "already initialized with system id {}, can't set {}",
                        system_id,
                        given
                    );
                }
            }
            Ok(system_id)
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            let system_id = given.unwrap_or_else(rand::random);
            let mut f = File::create(&id_file_path)
                .with_context(|| format!("failed to create id file at {:?}", id_file_path))?;
            f.write_all(system_id.to_string().as_bytes())?;
            f.sync_all()?;
            info!("initialized system id {}", system_id);
            Ok(system_id)
        }
        Err(error) => Err(error.into()),
    }
}

/// Re-derive the flush pointer and the recycling watermark from what is on
/// disk. The external flusher works in whole segments and pokes us with
/// SIGUSR1 after each one.
fn refresh_wal_state(conf: &WalSenderConf, system: &SystemState) -> Result<()> {
    let wal_dir = conf.wal_dir();
    let end = find_end_of_wal(&wal_dir, conf.wal_seg_size, conf.timeline)?;
    system.advance_flush_ptr(end);

    if let Some((logid, seg)) = find_oldest_segment(&wal_dir, conf.timeline)? {
        if (logid, seg) != (0, 0) {
            let (last_logid, last_seg) = if seg > 0 {
                (logid, seg - 1)
            } else {
                let segs_per_file = log_file_size(conf.wal_seg_size) / conf.wal_seg_size;
                (logid - 1, segs_per_file - 1)
            };
            system.set_last_removed_segment(last_logid, last_seg);
        }
    }
    Ok(())
}

fn start_signal_thread(
    conf: WalSenderConf,
    system: Arc<SystemState>,
    ctl: Arc<WalSndCtl>,
) -> Result<()> {
    thread::Builder::new()
        .name("signal handler thread".into())
        .spawn(move || {
            let res = signals::handle(
                &[SIGHUP, SIGINT, SIGTERM, SIGQUIT, SIGUSR1, SIGUSR2],
                |sig| {
                    match sig {
                        SIGHUP => {
                            info!("received SIGHUP, requesting configuration reload");
                            system.request_config_reload();
                            ctl.wake_all();
                        }
                        SIGINT => info!("received SIGINT, ignoring"),
                        SIGTERM => {
                            info!("received SIGTERM, shutting down");
                            system.request_shutdown();
                            ctl.wake_all();
                            wait_for_drain(&ctl);
                            std::process::exit(0);
                        }
                        SIGQUIT => {
                            // Emergency stop: no cleanup runs and exit code
                            // 2 tells the supervisor to treat this as a
                            // crash and reset shared state.
                            exit_now(2);
                        }
                        SIGUSR1 => {
                            if let Err(e) = refresh_wal_state(&conf, &system) {
                                error!("failed to rescan WAL directory: {:#}", e);
                            }
                            ctl.wake_all();
                        }
                        SIGUSR2 => {
                            info!("received SIGUSR2, draining WAL senders");
                            system.request_stop_after_drain();
                            ctl.wake_all();
                        }
                        other => warn!("unexpected signal {}", other),
                    }
                    Ok(())
                },
            );
            if let Err(e) = res {
                error!("signal handler thread failed: {:#}", e);
            }
        })
        .context("failed to spawn signal handler thread")?;
    Ok(())
}

/// Give senders a moment to ship their stream terminators before the
/// process exits.
fn wait_for_drain(ctl: &WalSndCtl) {
    for _ in 0..100 {
        if ctl.active_count() == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    warn!(
        "{} WAL sender(s) still active at shutdown",
        ctl.active_count()
    );
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
