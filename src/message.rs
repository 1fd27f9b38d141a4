//! Protocol frames.
//!
//! A [`Message`] is one frame: a method call, method return, error reply
//! or signal. It is append-only while being built, handed to the
//! connection for sending, and read once (cursor-driven) on the receiving
//! side. The `ok` flag latches false on the first failed read (a read
//! past the end of the body or of the enclosing container, a container
//! tag mismatch, malformed UTF-8) and is the single source of truth for
//! "did decoding succeed"; bulk readers check it once after the copy
//! instead of per element.
//!
//! The byte layout inside the body is the transport collaborator's own
//! (length-delimited containers with one-byte open tags); the signature
//! strings stored in variant containers and array tags follow the wire
//! signature grammar exactly.

use bytes::{BufMut, BytesMut};

use crate::error::{BusError, Error, Result};
use crate::names;
use crate::signature::{Basic, Signature, MAX_CONTAINER_DEPTH};
use crate::value::{ObjectPath, UnixFd};

bitflags::bitflags! {
    /// Per-message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        /// The caller does not want a reply; the dispatcher must not send one.
        const NO_REPLY_EXPECTED = 0x1;
        /// Do not auto-start an owner for the destination name.
        const NO_AUTO_START = 0x2;
        /// The peer may use interactive authorization.
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageKind {
    pub(crate) fn from_u8(v: u8) -> Option<MessageKind> {
        Some(match v {
            1 => MessageKind::MethodCall,
            2 => MessageKind::MethodReturn,
            3 => MessageKind::Error,
            4 => MessageKind::Signal,
            _ => return None,
        })
    }
}

const TAG_ARRAY: u8 = b'a';
const TAG_STRUCT_OPEN: u8 = b'(';
const TAG_STRUCT_CLOSE: u8 = b')';
const TAG_ENTRY_OPEN: u8 = b'{';
const TAG_ENTRY_CLOSE: u8 = b'}';
const TAG_VARIANT: u8 = b'v';

#[derive(Debug)]
struct WriteFrame {
    tag: u8,
    /// Offset of the length placeholder, for arrays.
    len_at: Option<usize>,
}

#[derive(Debug)]
struct ReadFrame {
    tag: u8,
    /// One past the last body byte of this container, for arrays.
    end: Option<usize>,
}

/// One protocol frame.
pub struct Message {
    kind: MessageKind,
    flags: MessageFlags,
    serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    body_signature: String,
    body: BytesMut,
    rpos: usize,
    ok: bool,
    write_stack: Vec<WriteFrame>,
    read_stack: Vec<ReadFrame>,
}

impl Message {
    fn new(kind: MessageKind) -> Message {
        Message {
            kind,
            flags: MessageFlags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body_signature: String::new(),
            body: BytesMut::new(),
            rpos: 0,
            ok: true,
            write_stack: Vec::new(),
            read_stack: Vec::new(),
        }
    }

    /// Create a method call frame. All names are grammar-checked here so a
    /// malformed call fails before anything reaches the wire.
    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        if let Some(dest) = destination {
            names::ensure_bus_name(dest)?;
        }
        names::ensure_object_path(path)?;
        names::ensure_interface_name(interface)?;
        names::ensure_member_name(member)?;
        let mut msg = Message::new(MessageKind::MethodCall);
        msg.destination = destination.map(str::to_string);
        msg.path = Some(path.to_string());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        Ok(msg)
    }

    /// Create a signal frame.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        names::ensure_object_path(path)?;
        names::ensure_interface_name(interface)?;
        names::ensure_member_name(member)?;
        let mut msg = Message::new(MessageKind::Signal);
        msg.path = Some(path.to_string());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        Ok(msg)
    }

    /// Create the success reply for a method call.
    pub fn method_return(call: &Message) -> Message {
        let mut msg = Message::new(MessageKind::MethodReturn);
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg
    }

    /// Create the error reply for a method call. The error message travels
    /// as the first body argument, the symbolic name in the header.
    pub fn error_reply(call: &Message, error: &BusError) -> Message {
        let mut msg = Message::new(MessageKind::Error);
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg.error_name = Some(error.name().to_string());
        if !error.message().is_empty() {
            // An append to a fresh message cannot fail.
            let _ = msg.append_str(error.message());
        }
        msg
    }

    /// A bodiless frame used as an encode/decode scratch pad.
    pub(crate) fn scratch() -> Message {
        Message::new(MessageKind::MethodCall)
    }

    pub(crate) fn from_wire_parts(
        kind: MessageKind,
        flags: MessageFlags,
        serial: u32,
        body_signature: String,
        body: BytesMut,
    ) -> Message {
        let mut msg = Message::new(kind);
        msg.flags = flags;
        msg.serial = serial;
        msg.body_signature = body_signature;
        msg.body = body;
        msg
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flags = flags;
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub(crate) fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub(crate) fn set_sender(&mut self, sender: Option<String>) {
        self.sender = sender;
    }

    pub(crate) fn set_header_field(&mut self, code: u8, value: String) {
        match code {
            1 => self.path = Some(value),
            2 => self.interface = Some(value),
            3 => self.member = Some(value),
            4 => self.error_name = Some(value),
            6 => self.destination = Some(value),
            7 => self.sender = Some(value),
            _ => {}
        }
    }

    pub(crate) fn set_reply_serial(&mut self, serial: u32) {
        self.reply_serial = Some(serial);
    }

    /// The signature of the body, one complete type per top-level argument.
    pub fn body_signature(&self) -> &str {
        &self.body_signature
    }

    pub(crate) fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// True if the sender wants a reply to this call.
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::MethodCall && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Turn the error reply into the remote error it carries.
    pub fn to_bus_error(&self) -> Option<BusError> {
        let name = self.error_name.as_deref()?;
        let mut snapshot = Message::from_wire_parts(
            self.kind,
            self.flags,
            self.serial,
            self.body_signature.clone(),
            self.body.clone(),
        );
        let text = if self.body_signature.starts_with('s') {
            snapshot.read_str().unwrap_or_default()
        } else {
            String::new()
        };
        Some(BusError::new_unchecked(name, text))
    }

    /// Did every read so far succeed?
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Convert a latched read failure into an error; call after bulk reads.
    pub fn ensure_ok(&self) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(Error::Decode("message exhausted or malformed".to_string()))
        }
    }

    /// Reset the read cursor to the start of the body.
    pub fn rewind(&mut self) {
        self.rpos = 0;
        self.ok = true;
        self.read_stack.clear();
    }

    fn fail(&mut self, what: &str) -> Error {
        self.ok = false;
        Error::Decode(what.to_string())
    }

    // ---- write side ----------------------------------------------------

    pub(crate) fn note_body_signature(&mut self, sig: &str) {
        if self.write_stack.is_empty() {
            self.body_signature.push_str(sig);
        }
    }

    pub fn append_bool(&mut self, v: bool) -> Result<()> {
        self.body.put_u8(v as u8);
        Ok(())
    }

    pub fn append_u8(&mut self, v: u8) -> Result<()> {
        self.body.put_u8(v);
        Ok(())
    }

    pub fn append_i16(&mut self, v: i16) -> Result<()> {
        self.body.put_i16_le(v);
        Ok(())
    }

    pub fn append_u16(&mut self, v: u16) -> Result<()> {
        self.body.put_u16_le(v);
        Ok(())
    }

    pub fn append_i32(&mut self, v: i32) -> Result<()> {
        self.body.put_i32_le(v);
        Ok(())
    }

    pub fn append_u32(&mut self, v: u32) -> Result<()> {
        self.body.put_u32_le(v);
        Ok(())
    }

    pub fn append_i64(&mut self, v: i64) -> Result<()> {
        self.body.put_i64_le(v);
        Ok(())
    }

    pub fn append_u64(&mut self, v: u64) -> Result<()> {
        self.body.put_u64_le(v);
        Ok(())
    }

    pub fn append_f64(&mut self, v: f64) -> Result<()> {
        self.body.put_f64_le(v);
        Ok(())
    }

    pub fn append_str(&mut self, v: &str) -> Result<()> {
        if v.contains('\0') {
            return Err(Error::Decode("string value contains NUL".to_string()));
        }
        self.body.put_u32_le(v.len() as u32);
        self.body.put_slice(v.as_bytes());
        Ok(())
    }

    pub fn append_object_path(&mut self, v: &ObjectPath) -> Result<()> {
        self.append_str(v.as_str())
    }

    pub fn append_signature(&mut self, v: &Signature) -> Result<()> {
        v.ensure_valid()?;
        let text = v.as_str();
        self.body.put_u8(text.len() as u8);
        self.body.put_slice(text.as_bytes());
        Ok(())
    }

    pub fn append_fd(&mut self, v: UnixFd) -> Result<()> {
        self.body.put_i32_le(v.0);
        Ok(())
    }

    fn check_depth(&self) -> Result<()> {
        if self.write_stack.len() >= MAX_CONTAINER_DEPTH * 2 {
            return Err(Error::InvalidSignature("container nesting too deep".to_string()));
        }
        Ok(())
    }

    /// Open an array container tagged with its element signature.
    pub fn open_array(&mut self, element: &Signature) -> Result<()> {
        element.ensure_valid()?;
        self.open_array_raw(element.as_str())
    }

    fn open_array_raw(&mut self, element_text: &str) -> Result<()> {
        self.check_depth()?;
        self.body.put_u8(TAG_ARRAY);
        self.body.put_u8(element_text.len() as u8);
        self.body.put_slice(element_text.as_bytes());
        let len_at = self.body.len();
        self.body.put_u32_le(0);
        self.write_stack.push(WriteFrame {
            tag: TAG_ARRAY,
            len_at: Some(len_at),
        });
        Ok(())
    }

    /// Open a map: an array whose elements are `{key value}` dict entries.
    pub fn open_dict(&mut self, key: &Signature, value: &Signature) -> Result<()> {
        key.ensure_valid()?;
        value.ensure_valid()?;
        if key.as_basic().is_none() {
            return Err(Error::InvalidSignature(format!(
                "dict key must be a basic type, got '{}'",
                key.as_str()
            )));
        }
        self.open_array_raw(&format!("{{{}{}}}", key.as_str(), value.as_str()))
    }

    pub fn close_array(&mut self) -> Result<()> {
        let frame = self.pop_write_frame(TAG_ARRAY)?;
        let len_at = frame.len_at.expect("array frame carries a length slot");
        let payload = (self.body.len() - len_at - 4) as u32;
        self.body[len_at..len_at + 4].copy_from_slice(&payload.to_le_bytes());
        Ok(())
    }

    pub fn open_dict_entry(&mut self) -> Result<()> {
        self.check_depth()?;
        self.body.put_u8(TAG_ENTRY_OPEN);
        self.write_stack.push(WriteFrame {
            tag: TAG_ENTRY_OPEN,
            len_at: None,
        });
        Ok(())
    }

    pub fn close_dict_entry(&mut self) -> Result<()> {
        self.pop_write_frame(TAG_ENTRY_OPEN)?;
        self.body.put_u8(TAG_ENTRY_CLOSE);
        Ok(())
    }

    pub fn open_struct(&mut self) -> Result<()> {
        self.check_depth()?;
        self.body.put_u8(TAG_STRUCT_OPEN);
        self.write_stack.push(WriteFrame {
            tag: TAG_STRUCT_OPEN,
            len_at: None,
        });
        Ok(())
    }

    pub fn close_struct(&mut self) -> Result<()> {
        self.pop_write_frame(TAG_STRUCT_OPEN)?;
        self.body.put_u8(TAG_STRUCT_CLOSE);
        Ok(())
    }

    /// Open a variant container tagged with the payload's own signature.
    pub fn open_variant(&mut self, payload: &Signature) -> Result<()> {
        payload.ensure_valid()?;
        self.check_depth()?;
        self.body.put_u8(TAG_VARIANT);
        let text = payload.as_str();
        self.body.put_u8(text.len() as u8);
        self.body.put_slice(text.as_bytes());
        self.write_stack.push(WriteFrame {
            tag: TAG_VARIANT,
            len_at: None,
        });
        Ok(())
    }

    pub fn close_variant(&mut self) -> Result<()> {
        self.pop_write_frame(TAG_VARIANT)?;
        Ok(())
    }

    fn pop_write_frame(&mut self, tag: u8) -> Result<WriteFrame> {
        match self.write_stack.pop() {
            Some(frame) if frame.tag == tag => Ok(frame),
            Some(frame) => {
                self.write_stack.push(frame);
                Err(Error::Decode("mismatched container close".to_string()))
            }
            None => Err(Error::Decode("container close without open".to_string())),
        }
    }

    /// Bulk append for arrays of trivial (fixed-size, non-bool) elements:
    /// the whole native buffer goes into the body in one call.
    pub fn append_trivial_array(&mut self, element: Basic, raw: &[u8]) -> Result<()> {
        let size = element
            .fixed_size()
            .filter(|_| element != Basic::Bool)
            .ok_or_else(|| {
                Error::InvalidSignature("bulk transfer needs a trivial element type".to_string())
            })?;
        debug_assert_eq!(raw.len() % size, 0);
        self.open_array(&Signature::basic(element))?;
        self.body.put_slice(raw);
        self.close_array()
    }

    // ---- read side -----------------------------------------------------

    /// One past the last readable byte in the current container.
    fn limit(&self) -> usize {
        self.read_stack
            .iter()
            .rev()
            .find_map(|f| f.end)
            .unwrap_or(self.body.len())
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&[u8]> {
        if self.rpos + n > self.limit() {
            return Err(self.fail(what));
        }
        self.rpos += n;
        Ok(&self.body[self.rpos - n..self.rpos])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let b = self.take(1, "read past end of bool")?[0];
        match b {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.fail("boolean value was not 0 or 1")),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "read past end of byte")?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let b = self.take(2, "read past end of int16")?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2, "read past end of uint16")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4, "read past end of int32")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "read past end of uint32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8, "read past end of int64")?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8, "read past end of uint64")?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8, "read past end of double")?;
        Ok(f64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len, "read past end of string")?.to_vec();
        String::from_utf8(bytes).map_err(|_| self.fail("string value is not UTF-8"))
    }

    pub fn read_object_path(&mut self) -> Result<ObjectPath> {
        let s = self.read_str()?;
        ObjectPath::new(s).map_err(|_| self.fail("malformed object path"))
    }

    pub fn read_signature_value(&mut self) -> Result<Signature> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len, "read past end of signature")?.to_vec();
        let text =
            String::from_utf8(bytes).map_err(|_| self.fail("signature value is not UTF-8"))?;
        Signature::parse(&text).map_err(|_| self.fail("malformed signature value"))
    }

    pub fn read_fd(&mut self) -> Result<UnixFd> {
        Ok(UnixFd(self.read_i32()?))
    }

    fn read_tag(&mut self, expected: u8, what: &str) -> Result<()> {
        let b = self.take(1, what)?[0];
        if b != expected {
            return Err(self.fail(what));
        }
        Ok(())
    }

    fn enter_array_raw(&mut self, element_text: &str) -> Result<()> {
        self.read_tag(TAG_ARRAY, "expected an array container")?;
        let on_wire = {
            let len = self.take(1, "truncated array signature")?[0] as usize;
            let bytes = self.take(len, "truncated array signature")?.to_vec();
            String::from_utf8(bytes).map_err(|_| self.fail("array signature is not UTF-8"))?
        };
        if on_wire != element_text {
            return Err(self.fail("array element signature mismatch"));
        }
        let payload = self.read_u32()? as usize;
        if self.rpos + payload > self.limit() {
            return Err(self.fail("array length exceeds message"));
        }
        self.read_stack.push(ReadFrame {
            tag: TAG_ARRAY,
            end: Some(self.rpos + payload),
        });
        Ok(())
    }

    /// Enter an array container; fails if the tag or element signature on
    /// the wire does not match the expected element.
    pub fn enter_array(&mut self, element: &Signature) -> Result<()> {
        self.enter_array_raw(element.as_str())
    }

    /// Enter a map container (array of `{key value}` dict entries).
    pub fn enter_dict(&mut self, key: &Signature, value: &Signature) -> Result<()> {
        self.enter_array_raw(&format!("{{{}{}}}", key.as_str(), value.as_str()))
    }

    /// Poll "is there more data in this container": the count-unknown
    /// decode path checks this before each element instead of relying on
    /// an element count.
    pub fn at_end_of_container(&self) -> bool {
        self.rpos >= self.limit()
    }

    pub fn exit_array(&mut self) -> Result<()> {
        match self.read_stack.pop() {
            Some(ReadFrame {
                tag: TAG_ARRAY,
                end: Some(end),
            }) => {
                // Tolerate a reader that stopped early; skip to the boundary.
                self.rpos = end;
                Ok(())
            }
            other => {
                if let Some(frame) = other {
                    self.read_stack.push(frame);
                }
                Err(self.fail("exit_array without matching enter"))
            }
        }
    }

    pub fn enter_dict_entry(&mut self) -> Result<()> {
        self.read_tag(TAG_ENTRY_OPEN, "expected a dict entry")?;
        self.read_stack.push(ReadFrame {
            tag: TAG_ENTRY_OPEN,
            end: None,
        });
        Ok(())
    }

    pub fn exit_dict_entry(&mut self) -> Result<()> {
        self.pop_read_frame(TAG_ENTRY_OPEN, "exit_dict_entry without matching enter")?;
        self.read_tag(TAG_ENTRY_CLOSE, "unterminated dict entry")
    }

    pub fn enter_struct(&mut self) -> Result<()> {
        self.read_tag(TAG_STRUCT_OPEN, "expected a struct container")?;
        self.read_stack.push(ReadFrame {
            tag: TAG_STRUCT_OPEN,
            end: None,
        });
        Ok(())
    }

    pub fn exit_struct(&mut self) -> Result<()> {
        self.pop_read_frame(TAG_STRUCT_OPEN, "exit_struct without matching enter")?;
        self.read_tag(TAG_STRUCT_CLOSE, "unterminated struct")
    }

    /// Enter a variant container, returning the payload signature that
    /// travelled with it.
    pub fn enter_variant(&mut self) -> Result<Signature> {
        self.read_tag(TAG_VARIANT, "expected a variant container")?;
        let sig = self.read_signature_value()?;
        self.read_stack.push(ReadFrame {
            tag: TAG_VARIANT,
            end: None,
        });
        Ok(sig)
    }

    pub fn exit_variant(&mut self) -> Result<()> {
        self.pop_read_frame(TAG_VARIANT, "exit_variant without matching enter")?;
        Ok(())
    }

    fn pop_read_frame(&mut self, tag: u8, what: &str) -> Result<()> {
        match self.read_stack.pop() {
            Some(frame) if frame.tag == tag => Ok(()),
            Some(frame) => {
                self.read_stack.push(frame);
                Err(self.fail(what))
            }
            None => Err(self.fail(what)),
        }
    }

    /// Bulk read for arrays of trivial elements: returns the raw element
    /// bytes in one copy. Check [`Message::ensure_ok`] afterwards.
    pub fn read_trivial_array(&mut self, element: Basic) -> Result<Vec<u8>> {
        let size = element
            .fixed_size()
            .filter(|_| element != Basic::Bool)
            .ok_or_else(|| {
                Error::InvalidSignature("bulk transfer needs a trivial element type".to_string())
            })?;
        self.enter_array(&Signature::basic(element))?;
        let end = self
            .read_stack
            .last()
            .and_then(|f| f.end)
            .expect("array frame carries an end");
        let raw = self.body[self.rpos..end].to_vec();
        if raw.len() % size != 0 {
            self.exit_array()?;
            return Err(self.fail("array length is not a multiple of the element size"));
        }
        self.rpos = end;
        self.exit_array()?;
        Ok(raw)
    }
}

/// Cloning snapshots the frame; the clone's read cursor starts at the
/// beginning of the body, so a shared message can be decoded by several
/// readers independently.
impl Clone for Message {
    fn clone(&self) -> Message {
        let mut msg = Message::from_wire_parts(
            self.kind,
            self.flags,
            self.serial,
            self.body_signature.clone(),
            self.body.clone(),
        );
        msg.path = self.path.clone();
        msg.interface = self.interface.clone();
        msg.member = self.member.clone();
        msg.error_name = self.error_name.clone();
        msg.reply_serial = self.reply_serial;
        msg.destination = self.destination.clone();
        msg.sender = self.sender.clone();
        msg
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("member", &self.member)
            .field("error_name", &self.error_name)
            .field("reply_serial", &self.reply_serial)
            .field("destination", &self.destination)
            .field("signature", &self.body_signature)
            .field("body_len", &self.body.len())
            .finish()
    }
}
