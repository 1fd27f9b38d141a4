//! The byte transport underneath a connection: frame codec, inbound queue,
//! bus addresses, listeners and the poll plumbing the event loop runs on.
//!
//! Frames are length-prefixed; the header carries the message kind, flags,
//! serial and the tagged header fields (path, interface, member, error
//! name, reply serial, destination, sender, body signature), followed by
//! the marshalled body. The layout is this transport's own; the signature
//! strings inside it follow the wire grammar byte-for-byte.

use std::collections::VecDeque;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::message::{Message, MessageFlags, MessageKind};
use crate::stream::Stream;

const PROTOCOL_VERSION: u8 = 1;
/// Upper bound on one frame; anything larger is a protocol error.
const MAX_FRAME_LEN: usize = 128 * 1024 * 1024;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;

/// A parsed bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    UnixPath(PathBuf),
    UnixAbstract(String),
    Tcp(String, u16),
}

impl BusAddress {
    /// Parse one entry of the bus address grammar:
    /// `unix:path=…`, `unix:abstract=…` or `tcp:host=…,port=…`.
    /// Of a `;`-separated list, the first entry is used.
    pub fn parse(address: &str) -> Result<BusAddress> {
        let entry = address
            .split(';')
            .next()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
        let (transport, rest) = entry
            .split_once(':')
            .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
        let mut pairs = Vec::new();
        if !rest.is_empty() {
            for pair in rest.split(',') {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
                pairs.push((k, v));
            }
        }
        let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
        match transport {
            "unix" => {
                if let Some(path) = get("path") {
                    Ok(BusAddress::UnixPath(PathBuf::from(path)))
                } else if let Some(name) = get("abstract") {
                    Ok(BusAddress::UnixAbstract(name.to_string()))
                } else {
                    Err(Error::InvalidAddress(address.to_string()))
                }
            }
            "tcp" => {
                let host = get("host")
                    .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
                let port: u16 = get("port")
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
                Ok(BusAddress::Tcp(host.to_string(), port))
            }
            _ => Err(Error::InvalidAddress(address.to_string())),
        }
    }

    /// Connect a stream to this address.
    pub fn connect(&self) -> Result<Box<dyn Stream>> {
        match self {
            BusAddress::UnixPath(path) => Ok(Box::new(UnixStream::connect(path)?)),
            BusAddress::UnixAbstract(name) => Ok(Box::new(connect_abstract(name)?)),
            BusAddress::Tcp(host, port) => {
                Ok(Box::new(TcpStream::connect((host.as_str(), *port))?))
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    Ok(UnixStream::connect_addr(&addr)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(Error::InvalidAddress(format!("unix:abstract={}", name)))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    Ok(UnixListener::bind_addr(&addr)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    Err(Error::InvalidAddress(format!("unix:abstract={}", name)))
}

/// EINTR-safe wrapper around `poll(2)`.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != IoErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

/// Wait until `fd` is readable or `timeout_ms` passes.
pub(crate) fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<bool> {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    Ok(poll(&mut fds, timeout_ms)? > 0)
}

/// A self-pipe notification descriptor, used for the event loop's wake-up
/// and loop-exit signals.
pub(crate) struct Notifier {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Notifier {
    pub fn new() -> Result<Notifier> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Notifier {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Signal the notifier; a full pipe already counts as signalled.
    pub fn notify(&self) {
        let byte = [1u8];
        unsafe {
            let _ = libc::write(self.write_fd, byte.as_ptr().cast(), 1);
        }
    }

    /// Consume all pending notifications.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// A listening socket for direct (peer-to-peer) connections.
pub struct Listener {
    inner: ListenerKind,
    /// Path to unlink when the listener goes away.
    cleanup: Option<PathBuf>,
}

enum ListenerKind {
    Unix(UnixListener),
    Tcp(std::net::TcpListener),
}

impl Listener {
    /// Bind to a bus address.
    pub fn bind(address: &str) -> Result<Listener> {
        match BusAddress::parse(address)? {
            BusAddress::UnixPath(path) => {
                // A stale socket file from an earlier run would break bind.
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                Ok(Listener {
                    inner: ListenerKind::Unix(listener),
                    cleanup: Some(path),
                })
            }
            BusAddress::UnixAbstract(name) => {
                let listener = bind_abstract(&name)?;
                Ok(Listener {
                    inner: ListenerKind::Unix(listener),
                    cleanup: None,
                })
            }
            BusAddress::Tcp(host, port) => {
                let listener = std::net::TcpListener::bind((host.as_str(), port))?;
                Ok(Listener {
                    inner: ListenerKind::Tcp(listener),
                    cleanup: None,
                })
            }
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            ListenerKind::Unix(l) => l.as_raw_fd(),
            ListenerKind::Tcp(l) => l.as_raw_fd(),
        }
    }

    /// Accept one connection, waiting at most `timeout_ms` (0 waits
    /// forever). Times out with [`Error::Timeout`].
    pub fn accept(&self, timeout_ms: u64) -> Result<Box<dyn Stream>> {
        if timeout_ms > 0 && !wait_readable(self.as_raw_fd(), timeout_ms as i32)? {
            return Err(Error::Timeout);
        }
        match &self.inner {
            ListenerKind::Unix(l) => {
                let (stream, _addr) = l.accept()?;
                Ok(Box::new(stream))
            }
            ListenerKind::Tcp(l) => {
                let (stream, _addr) = l.accept()?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.cleanup.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn put_string_field(buf: &mut BytesMut, code: u8, value: &str) {
    buf.put_u8(code);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Serialize a message into one frame.
pub(crate) fn encode_frame(msg: &Message) -> BytesMut {
    let mut fields = BytesMut::new();
    let mut n_fields = 0u8;
    let mut string_field = |code: u8, value: Option<&str>| {
        if let Some(value) = value {
            put_string_field(&mut fields, code, value);
            n_fields += 1;
        }
    };
    string_field(FIELD_PATH, msg.path());
    string_field(FIELD_INTERFACE, msg.interface());
    string_field(FIELD_MEMBER, msg.member());
    string_field(FIELD_ERROR_NAME, msg.error_name());
    string_field(FIELD_DESTINATION, msg.destination());
    string_field(FIELD_SENDER, msg.sender());
    if !msg.body_signature().is_empty() {
        string_field(FIELD_SIGNATURE, Some(msg.body_signature()));
    }
    if let Some(serial) = msg.reply_serial() {
        fields.put_u8(FIELD_REPLY_SERIAL);
        fields.put_u32_le(4);
        fields.put_u32_le(serial);
        n_fields += 1;
    }

    let body = msg.body_bytes();
    let payload_len = 4 + 4 + 1 + fields.len() + body.len();
    let mut frame = BytesMut::with_capacity(4 + payload_len);
    frame.put_u32_le(payload_len as u32);
    frame.put_u8(msg.kind() as u8);
    frame.put_u8(msg.flags().bits());
    frame.put_u8(PROTOCOL_VERSION);
    frame.put_u8(0);
    frame.put_u32_le(msg.serial());
    frame.put_u8(n_fields);
    frame.put_slice(&fields);
    frame.put_slice(body);
    frame
}

/// Try to parse one frame from the front of `buf`. Returns `None` when the
/// buffer does not yet hold a complete frame.
pub(crate) fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let payload_len =
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(Error::Decode(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload_len, MAX_FRAME_LEN
        )));
    }
    if buf.len() < 4 + payload_len {
        return Ok(None);
    }
    buf.advance(4);
    let mut payload = buf.split_to(payload_len);

    if payload.len() < 9 {
        return Err(Error::Decode("truncated frame header".to_string()));
    }
    let kind = MessageKind::from_u8(payload.get_u8())
        .ok_or_else(|| Error::Decode("unknown message kind".to_string()))?;
    let flags = MessageFlags::from_bits_truncate(payload.get_u8());
    let version = payload.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(Error::Decode(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    payload.advance(1);
    let serial = payload.get_u32_le();
    let n_fields = payload.get_u8();

    let mut signature = String::new();
    let mut reply_serial = None;
    let mut string_fields: Vec<(u8, String)> = Vec::new();
    for _ in 0..n_fields {
        if payload.len() < 5 {
            return Err(Error::Decode("truncated header field".to_string()));
        }
        let code = payload.get_u8();
        let len = payload.get_u32_le() as usize;
        if payload.len() < len {
            return Err(Error::Decode("truncated header field".to_string()));
        }
        if code == FIELD_REPLY_SERIAL {
            if len != 4 {
                return Err(Error::Decode("malformed reply-serial field".to_string()));
            }
            reply_serial = Some(payload.get_u32_le());
            continue;
        }
        let raw = payload.split_to(len);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::Decode("header field is not UTF-8".to_string()))?
            .to_string();
        if code == FIELD_SIGNATURE {
            signature = text;
        } else {
            string_fields.push((code, text));
        }
    }

    let mut msg = Message::from_wire_parts(kind, flags, serial, signature, payload);
    for (code, text) in string_fields {
        msg.set_header_field(code, text);
    }
    if let Some(serial) = reply_serial {
        msg.set_reply_serial(serial);
    }
    Ok(Some(msg))
}

/// The transport a connection owns: one stream, a read buffer, and the
/// queue of parsed-but-unprocessed inbound messages.
pub(crate) struct BusTransport {
    stream: Box<dyn Stream>,
    fd: RawFd,
    rbuf: BytesMut,
    inbound: VecDeque<Message>,
    closed: bool,
}

impl BusTransport {
    pub fn new(mut stream: Box<dyn Stream>) -> Result<BusTransport> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(BusTransport {
            stream,
            fd,
            rbuf: BytesMut::with_capacity(8 * 1024),
            inbound: VecDeque::new(),
            closed: false,
        })
    }

    /// The descriptor the event loop polls.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Write one message to the wire, blocking until it is fully sent.
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        self.ensure_open()?;
        let frame = encode_frame(msg);
        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    let mut fds = [libc::pollfd {
                        fd: self.fd,
                        events: libc::POLLOUT,
                        revents: 0,
                    }];
                    poll(&mut fds, -1)?;
                }
                Err(e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Drain everything readable right now into the inbound queue.
    /// Returns the number of newly parsed messages.
    pub fn read_pending(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let mut chunk = [0u8; 8 * 1024];
        let mut parsed = 0;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    if parsed > 0 {
                        // Deliver what we have; the next read reports the close.
                        return Ok(parsed);
                    }
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => {
                    self.rbuf.extend_from_slice(&chunk[..n]);
                    while let Some(msg) = decode_frame(&mut self.rbuf)? {
                        self.inbound.push_back(msg);
                        parsed += 1;
                    }
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => return Ok(parsed),
                Err(e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Number of queued-but-unprocessed inbound messages.
    pub fn queued(&self) -> usize {
        self.inbound.len()
    }

    pub fn pop_inbound(&mut self) -> Option<Message> {
        self.inbound.pop_front()
    }

    /// Pull the reply to `serial` out of the queue, if it has arrived,
    /// without disturbing other queued messages.
    pub fn take_reply(&mut self, serial: u32) -> Option<Message> {
        let at = self.inbound.iter().position(|m| {
            matches!(m.kind(), MessageKind::MethodReturn | MessageKind::Error)
                && m.reply_serial() == Some(serial)
        })?;
        self.inbound.remove(at)
    }

    pub fn shutdown(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown();
    }
}

/// Wrap an already-connected descriptor (e.g. one end of a socket pair).
///
/// Takes ownership of the descriptor.
pub(crate) fn stream_from_fd(fd: RawFd) -> Box<dyn Stream> {
    Box::new(unsafe { UnixStream::from_raw_fd(fd) })
}
