//! Listens for replication connections and runs one WAL sender per
//! connection, each on its own thread.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Result};
use tracing::*;
use utils::postgres_backend::PostgresBackend;
use utils::pq_proto::BeMessage;

use crate::send_wal::SendWalHandler;
use crate::slots::WalSndCtl;
use crate::system::SystemState;
use crate::WalSenderConf;

/// Connection ids double as the slot table's owner pids; 0 means free, so
/// ids start at 1.
pub type ConnectionId = u32;
pub type ConnectionCount = u32;

pub fn issue_connection_id(count: &mut ConnectionCount) -> ConnectionId {
    *count = count.wrapping_add(1);
    if *count == 0 {
        *count = 1;
    }
    *count
}

/// Accept incoming TCP connections and spawn each into a sender thread.
pub fn thread_main(
    conf: Arc<WalSenderConf>,
    system: Arc<SystemState>,
    ctl: Arc<WalSndCtl>,
    listener: TcpListener,
) -> Result<()> {
    info!("WAL sender service on {}", conf.listen_pg_addr);
    let mut connection_count: ConnectionCount = 0;

    loop {
        match listener.accept() {
            Ok((socket, peer_addr)) => {
                debug!("accepted connection from {}", peer_addr);
                let conf = Arc::clone(&conf);
                let system = Arc::clone(&system);
                let ctl = Arc::clone(&ctl);
                let conn_id = issue_connection_id(&mut connection_count);

                let _ = thread::Builder::new()
                    .name("WAL sender thread".into())
                    .spawn(move || {
                        if let Err(err) = handle_socket(socket, &conf, &system, &ctl, conn_id) {
                            error!("connection handler exited: {:#}", err);
                        }
                    });
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
}

fn handle_socket(
    socket: TcpStream,
    conf: &WalSenderConf,
    system: &SystemState,
    ctl: &Arc<WalSndCtl>,
    conn_id: ConnectionId,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut pgb = PostgresBackend::new(socket)?;

    if let Err(e) = serve_connection(&mut pgb, conf, system, ctl, conn_id) {
        // Tell the standby what happened before hanging up, then stop
        // talking to this socket: from here on the failure goes to the
        // server log only.
        pgb.report_error(&format!("{:#}", e));
        return Err(e);
    }
    Ok(())
}

/// Per-sender lifecycle: startup exchange, recovery refusal, slot claim,
/// initial ReadyForQuery, handshake, streaming. The slot is released when
/// the handle drops, on every exit path.
fn serve_connection(
    pgb: &mut PostgresBackend,
    conf: &WalSenderConf,
    system: &SystemState,
    ctl: &Arc<WalSndCtl>,
    conn_id: ConnectionId,
) -> Result<()> {
    let params = match pgb.handle_startup()? {
        Some(params) => params,
        None => return Ok(()),
    };
    let appname = params.get("application_name").cloned();

    if system.in_recovery() {
        bail!("recovery is still in progress, can't accept WAL streaming connections");
    }

    let slot = ctl.allocate(conn_id)?;
    info!(
        "WAL sender {} serving {}{}",
        conn_id,
        pgb.peer_addr(),
        appname
            .as_deref()
            .map(|n| format!(" ({})", n))
            .unwrap_or_default(),
    );

    // Tell the standby we are ready for commands.
    pgb.write_message(&BeMessage::ReadyForQuery)?;

    SendWalHandler::new(conf, system, &slot, appname).run(pgb)
}
