//! Postgres protocol messages serialization-deserialization. See
//! <https://www.postgresql.org/docs/devel/protocol-message-formats.html>
//! on message formats.
//!
//! Only the subset spoken by a WAL sender is implemented: simple query and
//! terminate on the inbound side, result-set / copy / error messages on the
//! outbound side.

use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, BE};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::{self, Read};
use std::str;

pub type Oid = u32;
pub type SystemId = u64;

pub const INT4_OID: Oid = 23;
pub const TEXT_OID: Oid = 25;

#[derive(Debug)]
pub enum FeMessage {
    Query(Bytes), // Simple query
    Terminate,
    CopyData(Bytes),
    CopyDone,
    CopyFail,
    Sync,
}

#[derive(Debug)]
pub enum FeStartupPacket {
    CancelRequest,
    SslRequest,
    GssEncRequest,
    StartupMessage {
        major_version: u32,
        minor_version: u32,
        params: HashMap<String, String>,
    },
}

impl FeMessage {
    /// Read one message from the stream.
    /// This function returns `Ok(None)` in case of EOF on a message
    /// boundary; EOF in the middle of a message is an error.
    pub fn read(stream: &mut impl Read) -> Result<Option<FeMessage>> {
        // Each libpq message begins with a message type byte, followed by
        // message length.
        let tag = match stream.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = stream.read_u32::<BE>()?;

        // The message length includes itself, so it better be at least 4
        let bodylen = len
            .checked_sub(4)
            .ok_or_else(|| anyhow!("invalid message length {}", len))?;

        let mut body_buf: Vec<u8> = vec![0; bodylen as usize];
        stream.read_exact(&mut body_buf)?;
        let body = Bytes::from(body_buf);

        match tag {
            b'Q' => Ok(Some(FeMessage::Query(body))),
            b'X' => Ok(Some(FeMessage::Terminate)),
            b'd' => Ok(Some(FeMessage::CopyData(body))),
            b'c' => Ok(Some(FeMessage::CopyDone)),
            b'f' => Ok(Some(FeMessage::CopyFail)),
            b'S' => Ok(Some(FeMessage::Sync)),
            tag => bail!("unknown message tag: {}", tag),
        }
    }
}

impl FeStartupPacket {
    /// Read a startup message from the stream. Startup messages have no
    /// type byte; the variant is encoded in a request code instead.
    pub fn read(stream: &mut impl Read) -> Result<Option<FeStartupPacket>> {
        const MAX_STARTUP_PACKET_LENGTH: usize = 10000;
        const RESERVED_INVALID_MAJOR_VERSION: u32 = 1234;
        const CANCEL_REQUEST_CODE: u32 = 5678;
        const NEGOTIATE_SSL_CODE: u32 = 5679;
        const NEGOTIATE_GSS_CODE: u32 = 5680;

        // If the connection is closed before any bytes arrive, report EOF
        // quietly; a client probing the port and going away is not an error.
        let len = match stream.read_u32::<BE>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len < 8 || len > MAX_STARTUP_PACKET_LENGTH {
            bail!("invalid startup packet length {}", len);
        }

        let request_code = stream.read_u32::<BE>()?;
        let params_len = len - 8;
        let mut params_bytes = vec![0u8; params_len];
        stream.read_exact(params_bytes.as_mut())?;

        let major_version = request_code >> 16;
        let minor_version = request_code & 0xffff;
        let packet = match (major_version, minor_version) {
            (RESERVED_INVALID_MAJOR_VERSION, CANCEL_REQUEST_CODE) => {
                FeStartupPacket::CancelRequest
            }
            (RESERVED_INVALID_MAJOR_VERSION, NEGOTIATE_SSL_CODE) => FeStartupPacket::SslRequest,
            (RESERVED_INVALID_MAJOR_VERSION, NEGOTIATE_GSS_CODE) => FeStartupPacket::GssEncRequest,
            (RESERVED_INVALID_MAJOR_VERSION, code) => {
                bail!("unrecognized request code {}", code)
            }
            (major_version, minor_version) => {
                // Null-terminated (name, value) pairs.
                let params_str = str::from_utf8(&params_bytes)
                    .map_err(|_| anyhow!("startup packet params: invalid utf-8"))?;
                let mut params = HashMap::new();
                let mut tokens = params_str.split_terminator('\0');
                while let Some(name) = tokens.next() {
                    if name.is_empty() {
                        break;
                    }
                    let value = tokens
                        .next()
                        .ok_or_else(|| anyhow!("expected even number of params in startup packet"))?;
                    params.insert(name.to_string(), value.to_string());
                }
                FeStartupPacket::StartupMessage {
                    major_version,
                    minor_version,
                    params,
                }
            }
        };
        Ok(Some(packet))
    }
}

// Backend

#[derive(Debug)]
pub enum BeMessage<'a> {
    AuthenticationOk,
    CommandComplete(&'a [u8]),
    CopyData(&'a [u8]),
    CopyDone,
    CopyOutResponse,
    CopyBothResponse,
    // None means column is NULL
    DataRow(&'a [Option<&'a [u8]>]),
    ErrorResponse(&'a str),
    // single byte - used in response to SSLRequest/GSSENCRequest
    EncryptionResponse(bool),
    ParameterStatus { name: &'a [u8], value: &'a [u8] },
    ReadyForQuery,
    RowDescription(&'a [RowDescriptor<'a>]),
    XLogData(XLogDataBody<'a>),
}

// One row description in a RowDescription packet.
#[derive(Debug)]
pub struct RowDescriptor<'a> {
    pub name: &'a [u8],
    pub tableoid: Oid,
    pub attnum: i16,
    pub typoid: Oid,
    pub typlen: i16,
    pub typmod: i32,
    pub formatcode: i16,
}

impl Default for RowDescriptor<'_> {
    fn default() -> RowDescriptor<'static> {
        RowDescriptor {
            name: b"",
            tableoid: 0,
            attnum: 0,
            typoid: 0,
            typlen: 0,
            typmod: 0,
            formatcode: 0,
        }
    }
}

/// Payload of a CopyData frame carrying WAL: the `'w'` marker, the position
/// of the first byte, the current flush pointer, the send timestamp, then
/// the raw WAL bytes.
#[derive(Debug)]
pub struct XLogDataBody<'a> {
    pub wal_start: u64,
    pub wal_end: u64,
    pub timestamp: i64,
    pub data: &'a [u8],
}

/// Call f() to write the body of the message and prepend it with a 4-byte
/// length as prescribed by the protocol.
fn write_body<F>(buf: &mut BytesMut, f: F) -> io::Result<()>
where
    F: FnOnce(&mut BytesMut) -> io::Result<()>,
{
    let base = buf.len();
    buf.extend_from_slice(&[0; 4]);

    f(buf)?;

    let size = buf.len() - base;
    if size > i32::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "message too large to transmit",
        ));
    }
    BigEndian::write_i32(&mut buf[base..], size as i32);
    Ok(())
}

/// Safe write of s into buf as a cstring (String in the protocol).
pub fn write_cstr(s: &[u8], buf: &mut BytesMut) -> io::Result<()> {
    if s.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string contains embedded null",
        ));
    }
    buf.put_slice(s);
    buf.put_u8(0);
    Ok(())
}

/// Truncate zero terminator from a protocol string and validate it as utf-8.
pub fn cstr_to_str(b: &Bytes) -> Result<&str> {
    let without_null = if b.last() == Some(&0) {
        &b[..b.len() - 1]
    } else {
        &b[..]
    };
    str::from_utf8(without_null).map_err(|e| e.into())
}

impl<'a> BeMessage<'a> {
    /// Write message to the given buf.
    // BytesMut is handy here: the message length precedes the body, so we
    // reserve space for it first and fill it in afterwards.
    pub fn write(buf: &mut BytesMut, message: &BeMessage) -> io::Result<()> {
        match message {
            BeMessage::AuthenticationOk => {
                buf.put_u8(b'R');
                write_body(buf, |buf| {
                    buf.put_i32(0); // specifies that the authentication was successful
                    Ok(())
                })
                .unwrap(); // write into BytesMut can't fail
            }

            BeMessage::CommandComplete(cmd) => {
                buf.put_u8(b'C');
                write_body(buf, |buf| write_cstr(cmd, buf))?;
            }

            BeMessage::CopyData(data) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| {
                    buf.put_slice(data);
                    Ok(())
                })
                .unwrap();
            }

            BeMessage::CopyDone => {
                buf.put_u8(b'c');
                write_body(buf, |_| Ok(())).unwrap();
            }

            BeMessage::CopyOutResponse => {
                buf.put_u8(b'H');
                write_body(buf, |buf| {
                    buf.put_u8(0); /* copy_is_binary */
                    buf.put_i16(0); /* numAttributes */
                    Ok(())
                })
                .unwrap();
            }

            BeMessage::CopyBothResponse => {
                buf.put_u8(b'W');
                write_body(buf, |buf| {
                    // doesn't matter, used only for replication
                    buf.put_u8(0); /* copy_is_binary */
                    buf.put_i16(0); /* numAttributes */
                    Ok(())
                })
                .unwrap();
            }

            BeMessage::DataRow(vals) => {
                buf.put_u8(b'D');
                write_body(buf, |buf| {
                    buf.put_u16(vals.len() as u16); // num of cols
                    for val_opt in vals.iter() {
                        if let Some(val) = val_opt {
                            buf.put_u32(val.len() as u32);
                            buf.put_slice(val);
                        } else {
                            buf.put_i32(-1);
                        }
                    }
                    Ok(())
                })
                .unwrap();
            }

            // ErrorResponse is a zero-terminated array of zero-terminated
            // fields, each tagged with its type: 'S' severity, 'C' error
            // code, 'M' message text. That is the minimum clients expect.
            BeMessage::ErrorResponse(error_msg) => {
                buf.put_u8(b'E');
                write_body(buf, |buf| {
                    buf.put_u8(b'S');
                    write_cstr(b"ERROR", buf)?;

                    buf.put_u8(b'C'); // SQLSTATE error code
                    write_cstr(b"XX000", buf)?;

                    buf.put_u8(b'M');
                    write_cstr(error_msg.as_bytes(), buf)?;

                    buf.put_u8(0); // terminator
                    Ok(())
                })?;
            }

            BeMessage::EncryptionResponse(should_negotiate) => {
                let response = if *should_negotiate { b'S' } else { b'N' };
                buf.put_u8(response);
            }

            BeMessage::ParameterStatus { name, value } => {
                buf.put_u8(b'S');
                write_body(buf, |buf| {
                    write_cstr(name, buf)?;
                    write_cstr(value, buf)
                })?;
            }

            BeMessage::ReadyForQuery => {
                buf.put_u8(b'Z');
                write_body(buf, |buf| {
                    buf.put_u8(b'I');
                    Ok(())
                })
                .unwrap();
            }

            BeMessage::RowDescription(rows) => {
                buf.put_u8(b'T');
                write_body(buf, |buf| {
                    buf.put_i16(rows.len() as i16); // # of fields
                    for row in rows.iter() {
                        write_cstr(row.name, buf)?;
                        buf.put_i32(0); /* table oid */
                        buf.put_i16(0); /* attnum */
                        buf.put_u32(row.typoid);
                        buf.put_i16(row.typlen);
                        buf.put_i32(-1); /* typmod */
                        buf.put_i16(0); /* format code */
                    }
                    Ok(())
                })?;
            }

            BeMessage::XLogData(body) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| {
                    buf.put_u8(b'w');
                    buf.put_u64(body.wal_start);
                    buf.put_u64(body.wal_end);
                    buf.put_i64(body.timestamp);
                    buf.put_slice(body.data);
                    Ok(())
                })
                .unwrap();
            }
        }
        Ok(())
    }
}
