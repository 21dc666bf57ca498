//! Server-side synchronous Postgres connection, as limited as we need.
//! Handles the startup packet exchange, then hands framed message reading
//! and buffered message writing to the caller, which owns the command loop.

use crate::pq_proto::{BeMessage, FeMessage, FeStartupPacket};
use anyhow::Result;
use bytes::BytesMut;
use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::*;

#[derive(Debug, PartialEq, Eq)]
pub enum ProtoState {
    Initialization,
    Established,
}

pub struct PostgresBackend {
    stream_in: BufReader<TcpStream>,
    stream_out: TcpStream,
    // Output buffer. c.f. BeMessage::write why we are using BytesMut here.
    buf_out: BytesMut,

    pub state: ProtoState,

    peer_addr: SocketAddr,
}

impl PostgresBackend {
    pub fn new(socket: TcpStream) -> io::Result<Self> {
        let peer_addr = socket.peer_addr()?;
        let read_sock = socket.try_clone()?;
        Ok(PostgresBackend {
            stream_in: BufReader::new(read_sock),
            stream_out: socket,
            buf_out: BytesMut::with_capacity(10 * 1024),
            state: ProtoState::Initialization,
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Raw fd of the socket, for readiness waits.
    pub fn socket_fd(&self) -> RawFd {
        self.stream_out.as_raw_fd()
    }

    /// Process the connection up to the end of the startup phase: refuse
    /// encryption negotiation, accept the startup message (trust auth) and
    /// answer AuthenticationOk. Returns the startup parameters, or None if
    /// the client went away or sent a cancel request.
    ///
    /// The caller is expected to follow up with ReadyForQuery once it is
    /// actually ready to accept commands.
    pub fn handle_startup(&mut self) -> Result<Option<HashMap<String, String>>> {
        assert!(self.state == ProtoState::Initialization);
        loop {
            let packet = match FeStartupPacket::read(&mut self.stream_in)? {
                Some(packet) => packet,
                None => return Ok(None),
            };
            trace!("got startup packet {:?}", packet);
            match packet {
                FeStartupPacket::SslRequest | FeStartupPacket::GssEncRequest => {
                    self.write_message(&BeMessage::EncryptionResponse(false))?;
                }
                FeStartupPacket::CancelRequest => return Ok(None),
                FeStartupPacket::StartupMessage { params, .. } => {
                    self.write_message_noflush(&BeMessage::AuthenticationOk)?
                        .write_message_noflush(&BeMessage::ParameterStatus {
                            name: b"client_encoding",
                            value: b"UTF8",
                        })?;
                    self.state = ProtoState::Established;
                    return Ok(Some(params));
                }
            }
        }
    }

    /// Read one framed message, or None if the connection was closed.
    pub fn read_message(&mut self) -> Result<Option<FeMessage>> {
        assert!(self.state == ProtoState::Established);
        FeMessage::read(&mut self.stream_in)
    }

    /// Return one byte of pending input without blocking: `Ok(None)` when
    /// nothing is available, an `UnexpectedEof` error when the peer has
    /// closed the connection.
    pub fn get_byte_if_available(&mut self) -> io::Result<Option<u8>> {
        // The buffered reader may hold bytes that the socket no longer
        // shows; consume from it first.
        if !self.stream_in.buffer().is_empty() {
            let mut byte = [0u8; 1];
            self.stream_in.read_exact(&mut byte)?;
            return Ok(Some(byte[0]));
        }

        let mut byte = [0u8; 1];
        match recv(self.socket_fd(), &mut byte, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => Ok(Some(byte[0])),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Write message into internal output buffer.
    pub fn write_message_noflush(&mut self, message: &BeMessage) -> io::Result<&mut Self> {
        BeMessage::write(&mut self.buf_out, message)?;
        Ok(self)
    }

    /// Flush output buffer into the socket.
    pub fn flush(&mut self) -> io::Result<&mut Self> {
        self.stream_out.write_all(&self.buf_out)?;
        self.buf_out.clear();
        Ok(self)
    }

    /// Write message into internal buffer and flush it.
    pub fn write_message(&mut self, message: &BeMessage) -> io::Result<&mut Self> {
        self.write_message_noflush(message)?;
        self.flush()
    }

    /// Best-effort error report to the peer before tearing the connection
    /// down. Failures are ignored: if the socket is gone there is nobody
    /// left to tell.
    pub fn report_error(&mut self, message: &str) {
        self.buf_out.clear();
        if self.write_message(&BeMessage::ErrorResponse(message)).is_err() {
            debug!(
                "could not send error to {}: connection already closed",
                self.peer_addr
            );
        }
    }
}

/// An adapter wrapping everything written to it into CopyData messages.
pub struct CopyDataWriter<'a> {
    pgb: &'a mut PostgresBackend,
}

impl<'a> CopyDataWriter<'a> {
    pub fn new(pgb: &'a mut PostgresBackend) -> Self {
        CopyDataWriter { pgb }
    }
}

impl Write for CopyDataWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Flush as we go: the archive behind this can be far larger than
        // anything worth holding in the output buffer.
        self.pgb
            .write_message_noflush(&BeMessage::CopyData(buf))?
            .flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pgb.flush().map(|_| ())
    }
}
