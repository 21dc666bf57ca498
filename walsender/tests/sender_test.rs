//! End-to-end tests: boot the WAL service on a loopback listener and talk
//! to it the way a standby would.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use utils::lsn::Lsn;
use walsender::slots::WalSndCtl;
use walsender::system::SystemState;
use walsender::wal_service;
use walsender::xlog_utils::XLogFileName;
use walsender::WalSenderConf;

const SEG_SIZE: u32 = 0x10000;
const PAGE_SIZE: u32 = 0x800;
const MAX_SEND: u32 = 0x1000;
const SYSTEM_ID: u64 = 0xDEADBEEF;
const TLI: u32 = 1;

struct TestServer {
    system: Arc<SystemState>,
    ctl: Arc<WalSndCtl>,
    addr: SocketAddr,
    conf: Arc<WalSenderConf>,
    _dir: tempfile::TempDir,
}

fn start_server(max_wal_senders: usize) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let conf = Arc::new(WalSenderConf {
        data_dir: dir.path().to_path_buf(),
        max_wal_senders,
        wal_snd_delay: Duration::from_millis(50),
        wal_seg_size: SEG_SIZE,
        wal_page_size: PAGE_SIZE,
        max_send_size: MAX_SEND,
        ..Default::default()
    });
    conf.validate().unwrap();
    fs::create_dir_all(conf.wal_dir()).unwrap();

    let system = Arc::new(SystemState::new(SYSTEM_ID, TLI));
    let ctl = Arc::new(WalSndCtl::new(conf.max_wal_senders).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let service_conf = Arc::clone(&conf);
    let service_system = Arc::clone(&system);
    let service_ctl = Arc::clone(&ctl);
    thread::spawn(move || {
        let _ = wal_service::thread_main(service_conf, service_system, service_ctl, listener);
    });

    TestServer {
        system,
        ctl,
        addr,
        conf,
        _dir: dir,
    }
}

fn write_segment(wal_dir: &Path, logid: u32, seg: u32) {
    let base = seg * SEG_SIZE;
    let data: Vec<u8> = (0..SEG_SIZE).map(|i| ((base + i) % 251) as u8).collect();
    fs::write(wal_dir.join(XLogFileName(TLI, logid, seg)), data).unwrap();
}

struct Standby {
    stream: TcpStream,
}

impl Standby {
    /// Connect and run the startup exchange up to ReadyForQuery.
    fn connect(server: &TestServer) -> Standby {
        let mut standby = Standby::connect_raw(server);
        loop {
            let (tag, _body) = standby.read_msg();
            match tag {
                b'R' | b'S' => continue,
                b'Z' => break,
                other => panic!("unexpected startup response {:?}", other as char),
            }
        }
        standby
    }

    /// Connect and send the startup packet, leaving the responses unread.
    fn connect_raw(server: &TestServer) -> Standby {
        let mut stream = TcpStream::connect(server.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        let params = b"user\0replicator\0application_name\0test_standby\0\0";
        stream
            .write_u32::<BigEndian>(4 + 4 + params.len() as u32)
            .unwrap();
        stream.write_u32::<BigEndian>(3 << 16).unwrap();
        stream.write_all(params).unwrap();
        Standby { stream }
    }

    fn send_query(&mut self, query: &str) {
        self.stream.write_u8(b'Q').unwrap();
        self.stream
            .write_u32::<BigEndian>(4 + query.len() as u32 + 1)
            .unwrap();
        self.stream.write_all(query.as_bytes()).unwrap();
        self.stream.write_u8(0).unwrap();
    }

    fn send_terminate(&mut self) {
        self.stream.write_u8(b'X').unwrap();
        self.stream.write_u32::<BigEndian>(4).unwrap();
    }

    fn read_msg(&mut self) -> (u8, Vec<u8>) {
        let tag = self.stream.read_u8().unwrap();
        let len = self.stream.read_u32::<BigEndian>().unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).unwrap();
        (tag, body)
    }

    /// There must be no message within the timeout.
    fn assert_silent(&mut self, timeout: Duration) {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            other => panic!("expected silence, got {:?}", other),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
    }

    fn expect_eof(&mut self) {
        let mut byte = [0u8; 1];
        assert_eq!(self.stream.read(&mut byte).unwrap(), 0);
    }
}

struct WalFrame {
    data_start: u64,
    wal_end: u64,
    payload: Vec<u8>,
}

fn parse_wal_frame(body: &[u8]) -> WalFrame {
    let mut cursor = Cursor::new(body);
    assert_eq!(cursor.read_u8().unwrap(), b'w');
    let data_start = cursor.read_u64::<BigEndian>().unwrap();
    let wal_end = cursor.read_u64::<BigEndian>().unwrap();
    let timestamp = cursor.read_i64::<BigEndian>().unwrap();
    assert!(timestamp > 0);
    let mut payload = Vec::new();
    cursor.read_to_end(&mut payload).unwrap();
    assert!(payload.len() <= MAX_SEND as usize);
    WalFrame {
        data_start,
        wal_end,
        payload,
    }
}

#[test]
fn identify_system() {
    let server = start_server(4);
    let mut standby = Standby::connect(&server);

    standby.send_query("IDENTIFY_SYSTEM");

    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'T');
    let nfields = BigEndian::read_i16(&body[0..2]);
    assert_eq!(nfields, 2);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("systemid"));
    assert!(text.contains("timeline"));

    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'D');
    let ncols = BigEndian::read_u16(&body[0..2]);
    assert_eq!(ncols, 2);
    let sysid_len = BigEndian::read_u32(&body[2..6]) as usize;
    let sysid = &body[6..6 + sysid_len];
    assert_eq!(sysid, SYSTEM_ID.to_string().as_bytes());
    let rest = &body[6 + sysid_len..];
    let tli_len = BigEndian::read_u32(&rest[0..4]) as usize;
    assert_eq!(&rest[4..4 + tli_len], TLI.to_string().as_bytes());

    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'C');
    assert_eq!(body, b"SELECT\0");

    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'Z');

    // The handshake loops: another command still works.
    standby.send_query("IDENTIFY_SYSTEM");
    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'T');
}

#[test]
fn start_at_caught_up_position() {
    let server = start_server(4);
    write_segment(&server.conf.wal_dir(), 0, 0);
    server.system.advance_flush_ptr(Lsn::new(0, 0x1000));

    let mut standby = Standby::connect(&server);
    standby.send_query("START_REPLICATION 0/1000");

    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'W');

    // Caught up: nothing flows until the flusher advances.
    standby.assert_silent(Duration::from_millis(300));

    server.system.advance_flush_ptr(Lsn::new(0, 0x1800));
    server.ctl.wake_all();

    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'd');
    let frame = parse_wal_frame(&body);
    assert_eq!(frame.data_start, 0x1000);
    assert_eq!(frame.wal_end, 0x1800);
    assert_eq!(frame.payload.len(), 0x800);
    // payload matches the segment bytes on disk
    let expected: Vec<u8> = (0x1000u32..0x1800).map(|i| (i % 251) as u8).collect();
    assert_eq!(frame.payload, expected);

    // The slot advertises the progress (published just after the frame is
    // flushed, so allow the sender a moment).
    let mut rows = server.ctl.senders();
    for _ in 0..100 {
        if rows.len() == 1 && rows[0].sent_ptr == "0/1800" {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        rows = server.ctl.senders();
    }
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sent_ptr, "0/1800");
    assert_eq!(rows[0].state, "STREAMING");
}

#[test]
fn catchup_streams_in_page_rounded_batches() {
    let server = start_server(4);
    write_segment(&server.conf.wal_dir(), 0, 0);
    server.system.advance_flush_ptr(Lsn::new(0, 0x5000));

    let mut standby = Standby::connect(&server);
    standby.send_query("START_REPLICATION 0/0");

    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'W');

    // The whole backlog arrives as max_send_size frames, each ending on a
    // page boundary, the final one exactly at the flush pointer.
    let mut pos = 0u64;
    while pos < 0x5000 {
        let (tag, body) = standby.read_msg();
        assert_eq!(tag, b'd');
        let frame = parse_wal_frame(&body);
        assert_eq!(frame.data_start, pos);
        pos += frame.payload.len() as u64;
        assert!(pos == 0x5000 || pos % PAGE_SIZE as u64 == 0);
        assert!(pos <= frame.wal_end);
    }
    assert_eq!(pos, 0x5000);
}

#[test]
fn drain_then_clean_shutdown() {
    let server = start_server(4);
    write_segment(&server.conf.wal_dir(), 0, 0);
    server.system.advance_flush_ptr(Lsn::new(0, 0x1800));

    let mut standby = Standby::connect(&server);
    standby.send_query("START_REPLICATION 0/1800");
    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'W');

    // New WAL appears, then the drain request lands.
    server.system.advance_flush_ptr(Lsn::new(0, 0x2000));
    server.system.request_stop_after_drain();
    server.ctl.wake_all();

    // Outstanding WAL is shipped first, then the stream terminator.
    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'd');
    let frame = parse_wal_frame(&body);
    assert_eq!(frame.data_start, 0x1800);
    assert_eq!(frame.payload.len(), 0x800);

    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'C');
    assert_eq!(body, b"COPY 0\0");

    standby.expect_eof();

    // The slot was released on the way out.
    for _ in 0..100 {
        if server.ctl.active_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.ctl.active_count(), 0);
}

#[test]
fn terminate_during_handshake() {
    let server = start_server(4);
    let mut standby = Standby::connect(&server);
    standby.send_terminate();
    standby.expect_eof();
}

#[test]
fn terminate_during_streaming() {
    let server = start_server(4);
    server.system.advance_flush_ptr(Lsn::new(0, 0x1000));

    let mut standby = Standby::connect(&server);
    standby.send_query("START_REPLICATION 0/1000");
    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'W');

    standby.send_terminate();
    standby.expect_eof();
}

#[test]
fn too_many_senders_is_refused() {
    let server = start_server(1);
    let _first = Standby::connect(&server);

    let mut second = Standby::connect_raw(&server);
    loop {
        let (tag, body) = second.read_msg();
        if tag == b'E' {
            let text = String::from_utf8_lossy(&body);
            assert!(text.contains("max_wal_senders"), "unexpected error: {}", text);
            break;
        }
    }
}

#[test]
fn recovery_refuses_streaming() {
    let server = start_server(4);
    server.system.set_in_recovery(true);

    let mut standby = Standby::connect_raw(&server);
    loop {
        let (tag, body) = standby.read_msg();
        if tag == b'E' {
            let text = String::from_utf8_lossy(&body);
            assert!(text.contains("recovery"), "unexpected error: {}", text);
            break;
        }
    }
}

#[test]
fn unknown_command_is_fatal() {
    let server = start_server(4);
    let mut standby = Standby::connect(&server);

    standby.send_query("SELECT 1");
    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("invalid standby query string"));
}

#[test]
fn base_backup_streams_a_tarball() {
    let server = start_server(4);
    write_segment(&server.conf.wal_dir(), 0, 0);
    fs::write(server.conf.data_dir.join("server.conf"), "param=value\n").unwrap();
    fs::write(server.conf.system_id_path(), SYSTEM_ID.to_string()).unwrap();

    let mut standby = Standby::connect(&server);
    standby.send_query("BASE_BACKUP LABEL 'nightly' PROGRESS");

    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'H');

    let mut tarball = Vec::new();
    loop {
        let (tag, body) = standby.read_msg();
        match tag {
            b'd' => tarball.extend_from_slice(&body),
            b'c' => break,
            other => panic!("unexpected message {:?} in copy-out", other as char),
        }
    }

    let (tag, body) = standby.read_msg();
    assert_eq!(tag, b'C');
    assert_eq!(body, b"SELECT\0");
    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'Z');

    let mut names = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(tarball));
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        names.push(entry.path().unwrap().display().to_string());
    }
    assert!(names.iter().any(|n| n == "server.conf"));
    assert!(names.iter().any(|n| n.trim_end_matches('/') == "pg_wal"));
    // WAL segments are not part of the backup
    assert!(!names
        .iter()
        .any(|n| n.contains(&XLogFileName(TLI, 0, 0))));
    // neither is the server-private system identity file
    assert!(!names
        .iter()
        .any(|n| n.contains(walsender::SYSTEM_ID_FILE_NAME)));

    // The connection is back in command mode.
    standby.send_query("IDENTIFY_SYSTEM");
    let (tag, _) = standby.read_msg();
    assert_eq!(tag, b'T');
}
