//! The server side: vtables, registration and dispatch.
//!
//! A [`VTable`] collects method, signal and property records for one
//! interface. Registering it on an object path is a two-pass build: the
//! first pass validates every name and signature and sorts the records,
//! the second publishes the flattened table on the connection. Dispatch
//! looks records up by exact member name (binary search), decodes
//! arguments against the recorded input plan, and turns handler failures
//! into error replies; a misbehaving handler can reject a call but never
//! take the event loop down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};

use tracing::{debug, trace};

use crate::codec::{self, Arg, ArgList};
use crate::connection::{Connection, ConnectionInner};
use crate::error::{BusError, Error, Result, ERR_ACCESS_DENIED, ERR_PROPERTY_READ_ONLY};
use crate::message::Message;
use crate::names;
use crate::signature::Signature;
use crate::value::{ObjectPath, Value};

pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

bitflags::bitflags! {
    /// Interface-level flags, applied to every member unless overridden.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterfaceFlags: u8 {
        const DEPRECATED = 0x1;
        const PRIVILEGED = 0x2;
        /// Properties announce changes with values.
        const PROPERTIES_EMIT_CHANGE = 0x4;
        /// Properties announce changes by invalidation only.
        const PROPERTIES_EMIT_INVALIDATION = 0x8;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u8 {
        const DEPRECATED = 0x1;
        const PRIVILEGED = 0x2;
        /// The method never sends a reply.
        const NO_REPLY = 0x4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalFlags: u8 {
        const DEPRECATED = 0x1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PropertyFlags: u8 {
        const DEPRECATED = 0x1;
        /// Changes are announced with the new value (the default mode).
        const EMITS_CHANGE = 0x2;
        /// Changes are announced by name only.
        const EMITS_INVALIDATION = 0x4;
        /// The value never changes after registration.
        const CONST = 0x8;
    }
}

type MethodHandler =
    Box<dyn Fn(&mut Message) -> std::result::Result<Message, BusError> + Send + Sync>;
type PropertyGetter = Box<dyn Fn() -> std::result::Result<Value, BusError> + Send + Sync>;
type PropertySetter = Box<dyn Fn(Value) -> std::result::Result<(), BusError> + Send + Sync>;

struct MethodEntry {
    name: String,
    input_signature: String,
    output_signature: String,
    input_names: Vec<String>,
    output_names: Vec<String>,
    flags: MethodFlags,
    handler: MethodHandler,
}

struct SignalEntry {
    name: String,
    signature: String,
    arg_names: Vec<String>,
    flags: SignalFlags,
}

struct PropertyEntry {
    name: String,
    signature: String,
    getter: Option<PropertyGetter>,
    setter: Option<PropertySetter>,
    flags: PropertyFlags,
}

/// Builder for one interface's dispatch table.
#[derive(Default)]
pub struct VTable {
    methods: Vec<MethodEntry>,
    signals: Vec<SignalEntry>,
    properties: Vec<PropertyEntry>,
    flags: InterfaceFlags,
    /// Problems found while recording entries; surfaced at registration.
    defects: Vec<String>,
}

impl VTable {
    pub fn new() -> VTable {
        VTable::default()
    }

    pub fn with_flags(mut self, flags: InterfaceFlags) -> VTable {
        self.flags = flags;
        self
    }

    fn note_member_name(&mut self, kind: &str, name: &str) {
        if !names::is_valid_member_name(name) {
            self.defects.push(format!("bad {} name '{}'", kind, name));
        }
    }

    fn note_signature<L: ArgList>(&mut self, owner: &str) -> String {
        if let Err(e) = L::ensure_valid() {
            self.defects.push(format!("{}: {}", owner, e));
        }
        L::signature_text()
    }

    /// Record a method with typed inputs and outputs. The handler runs on
    /// the event-loop thread; returning `Err` sends an error reply.
    pub fn method<A, R, F>(self, name: &str, handler: F) -> VTable
    where
        A: ArgList,
        R: ArgList,
        F: Fn(A) -> std::result::Result<R, BusError> + Send + Sync + 'static,
    {
        self.method_full::<A, R, F>(name, &[], &[], MethodFlags::empty(), handler)
    }

    /// Record a method with parameter names and flags.
    pub fn method_full<A, R, F>(
        mut self,
        name: &str,
        input_names: &[&str],
        output_names: &[&str],
        flags: MethodFlags,
        handler: F,
    ) -> VTable
    where
        A: ArgList,
        R: ArgList,
        F: Fn(A) -> std::result::Result<R, BusError> + Send + Sync + 'static,
    {
        self.note_member_name("method", name);
        let input_signature = self.note_signature::<A>(&format!("method '{}' inputs", name));
        let output_signature = self.note_signature::<R>(&format!("method '{}' outputs", name));
        let wrapped: MethodHandler = Box::new(move |call: &mut Message| {
            let args = A::read_args(call).map_err(|e| BusError::invalid_args(e.to_string()))?;
            let out = handler(args)?;
            let mut reply = Message::method_return(call);
            out.append_args(&mut reply).map_err(BusError::from)?;
            Ok(reply)
        });
        self.methods.push(MethodEntry {
            name: name.to_string(),
            input_signature,
            output_signature,
            input_names: input_names.iter().map(|s| s.to_string()).collect(),
            output_names: output_names.iter().map(|s| s.to_string()).collect(),
            flags,
            handler: wrapped,
        });
        self
    }

    /// Declare a signal this interface emits.
    pub fn signal<A: ArgList>(self, name: &str) -> VTable {
        self.signal_full::<A>(name, &[], SignalFlags::empty())
    }

    pub fn signal_full<A: ArgList>(
        mut self,
        name: &str,
        arg_names: &[&str],
        flags: SignalFlags,
    ) -> VTable {
        self.note_member_name("signal", name);
        let signature = self.note_signature::<A>(&format!("signal '{}'", name));
        self.signals.push(SignalEntry {
            name: name.to_string(),
            signature,
            arg_names: arg_names.iter().map(|s| s.to_string()).collect(),
            flags,
        });
        self
    }

    /// Record a read-only property.
    pub fn property<T, G>(self, name: &str, getter: G) -> VTable
    where
        T: Arg,
        G: Fn() -> std::result::Result<T, BusError> + Send + Sync + 'static,
    {
        self.property_entry::<T>(name, Some(wrap_getter(getter)), None, PropertyFlags::EMITS_CHANGE)
    }

    /// Record a readable and writable property.
    pub fn property_writable<T, G, S>(self, name: &str, getter: G, setter: S) -> VTable
    where
        T: Arg,
        G: Fn() -> std::result::Result<T, BusError> + Send + Sync + 'static,
        S: Fn(T) -> std::result::Result<(), BusError> + Send + Sync + 'static,
    {
        self.property_entry::<T>(
            name,
            Some(wrap_getter(getter)),
            Some(wrap_setter(setter)),
            PropertyFlags::EMITS_CHANGE,
        )
    }

    /// Record a write-only property.
    pub fn property_write_only<T, S>(self, name: &str, setter: S) -> VTable
    where
        T: Arg,
        S: Fn(T) -> std::result::Result<(), BusError> + Send + Sync + 'static,
    {
        self.property_entry::<T>(name, None, Some(wrap_setter(setter)), PropertyFlags::empty())
    }

    fn property_entry<T: Arg>(
        mut self,
        name: &str,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
        flags: PropertyFlags,
    ) -> VTable {
        self.note_member_name("property", name);
        let sig = T::signature();
        if let Err(e) = sig.ensure_valid() {
            self.defects.push(format!("property '{}': {}", name, e));
        }
        self.properties.push(PropertyEntry {
            name: name.to_string(),
            signature: sig.as_str().to_string(),
            getter,
            setter,
            flags,
        });
        self
    }

    /// Pass one of the registration build: validate and sort the records.
    fn build(mut self, interface: &str) -> Result<RegisteredInterface> {
        names::ensure_interface_name(interface)?;
        if !self.defects.is_empty() {
            return Err(Error::InvalidName(format!(
                "vtable for '{}' rejected: {}",
                interface,
                self.defects.join("; ")
            )));
        }
        let duplicate = |names: &[&String]| -> Option<String> {
            let mut seen = std::collections::HashSet::new();
            names
                .iter()
                .find(|n| !seen.insert(n.as_str()))
                .map(|n| n.to_string())
        };
        self.methods.sort_by(|a, b| a.name.cmp(&b.name));
        self.signals.sort_by(|a, b| a.name.cmp(&b.name));
        self.properties.sort_by(|a, b| a.name.cmp(&b.name));
        for (kind, names) in [
            ("method", self.methods.iter().map(|m| &m.name).collect::<Vec<_>>()),
            ("signal", self.signals.iter().map(|s| &s.name).collect()),
            ("property", self.properties.iter().map(|p| &p.name).collect()),
        ] {
            if let Some(name) = duplicate(&names) {
                return Err(Error::InvalidName(format!(
                    "duplicate {} '{}' on interface '{}'",
                    kind, name, interface
                )));
            }
        }
        static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);
        Ok(RegisteredInterface {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            name: interface.to_string(),
            flags: self.flags,
            methods: self.methods,
            signals: self.signals,
            properties: self.properties,
        })
    }
}

fn wrap_getter<T, G>(getter: G) -> PropertyGetter
where
    T: Arg,
    G: Fn() -> std::result::Result<T, BusError> + Send + Sync + 'static,
{
    Box::new(move || {
        let value = getter()?;
        codec::to_value(&value).map_err(BusError::from)
    })
}

fn wrap_setter<T, S>(setter: S) -> PropertySetter
where
    T: Arg,
    S: Fn(T) -> std::result::Result<(), BusError> + Send + Sync + 'static,
{
    Box::new(move |value: Value| {
        let typed =
            codec::from_value::<T>(&value).map_err(|e| BusError::invalid_args(e.to_string()))?;
        setter(typed)
    })
}

/// The published form of a vtable: immutable, sorted, shared with the
/// dispatch path.
pub(crate) struct RegisteredInterface {
    id: u64,
    name: String,
    flags: InterfaceFlags,
    methods: Vec<MethodEntry>,
    signals: Vec<SignalEntry>,
    properties: Vec<PropertyEntry>,
}

impl std::fmt::Debug for RegisteredInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredInterface")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("methods", &self.methods.len())
            .field("signals", &self.signals.len())
            .field("properties", &self.properties.len())
            .finish()
    }
}

impl RegisteredInterface {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn find_method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|at| &self.methods[at])
    }

    fn find_signal(&self, name: &str) -> Option<&SignalEntry> {
        self.signals
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|at| &self.signals[at])
    }

    fn find_property(&self, name: &str) -> Option<&PropertyEntry> {
        self.properties
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|at| &self.properties[at])
    }
}

/// Owner handle for one registered interface. Dropping it (or calling
/// [`release`](InterfaceHandle::release)) atomically stops dispatch to the
/// interface; a table registered later under the same name is unaffected.
#[must_use = "dropping the handle unregisters the interface"]
pub struct InterfaceHandle {
    conn: Weak<ConnectionInner>,
    path: String,
    interface: String,
    table_id: u64,
}

impl InterfaceHandle {
    pub fn release(self) {}

    /// Give up ownership without unregistering: the interface then stays
    /// registered for the connection's lifetime (a floating
    /// registration).
    pub fn detach(self) {
        std::mem::forget(self);
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.conn.upgrade() {
            let conn = Connection { inner };
            conn.unregister_interface(&self.path, &self.interface, self.table_id);
            debug!(path = %self.path, interface = %self.interface, "interface released");
        }
    }
}

/// An object exposed on a connection under one path.
pub struct Object {
    conn: Connection,
    path: ObjectPath,
}

impl Object {
    pub fn new(conn: &Connection, path: &str) -> Result<Object> {
        Ok(Object {
            conn: conn.clone(),
            path: ObjectPath::new(path)?,
        })
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Register a vtable under an interface name. Re-registering the same
    /// interface replaces the previous table as a whole.
    pub fn add_interface(&self, interface: &str, vtable: VTable) -> Result<InterfaceHandle> {
        let table = std::sync::Arc::new(vtable.build(interface)?);
        let table_id = table.id();
        self.conn
            .register_interface(self.path.as_str(), interface, table)?;
        debug!(path = %self.path, interface, "interface registered");
        Ok(InterfaceHandle {
            conn: std::sync::Arc::downgrade(&self.conn.inner),
            path: self.path.as_str().to_string(),
            interface: interface.to_string(),
            table_id,
        })
    }

    /// Emit a signal declared by a registered interface. The payload must
    /// match the declared signature.
    pub fn emit_signal<A: ArgList>(&self, interface: &str, member: &str, args: A) -> Result<()> {
        names::ensure_interface_name(interface)?;
        names::ensure_member_name(member)?;
        let table = self
            .conn
            .lookup_interface(self.path.as_str(), interface)
            .ok_or_else(|| {
                Error::InvalidName(format!(
                    "interface '{}' is not registered at '{}'",
                    interface, self.path
                ))
            })?;
        let entry = table.find_signal(member).ok_or_else(|| {
            Error::InvalidName(format!(
                "signal '{}' is not declared on '{}'",
                member, interface
            ))
        })?;
        let got = A::signature_text();
        if got != entry.signature {
            return Err(Error::InvalidSignature(format!(
                "signal '{}' declares '{}', got '{}'",
                member, entry.signature, got
            )));
        }
        let mut msg = Message::signal(self.path.as_str(), interface, member)?;
        args.append_args(&mut msg)?;
        self.conn.send(msg)?;
        Ok(())
    }

    /// Emit the standard change notification for the named properties of
    /// a registered interface.
    pub fn emit_properties_changed(&self, interface: &str, properties: &[&str]) -> Result<()> {
        names::ensure_interface_name(interface)?;
        let table = self
            .conn
            .lookup_interface(self.path.as_str(), interface)
            .ok_or_else(|| {
                Error::InvalidName(format!(
                    "interface '{}' is not registered at '{}'",
                    interface, self.path
                ))
            })?;
        let mut changed: HashMap<String, Value> = HashMap::new();
        let mut invalidated: Vec<String> = Vec::new();
        for &name in properties {
            let entry = table.find_property(name).ok_or_else(|| {
                Error::InvalidName(format!(
                    "property '{}' is not declared on '{}'",
                    name, interface
                ))
            })?;
            let announce_value = entry.flags.contains(PropertyFlags::EMITS_CHANGE)
                && !entry.flags.contains(PropertyFlags::EMITS_INVALIDATION);
            match (&entry.getter, announce_value) {
                (Some(getter), true) => match getter() {
                    Ok(value) => {
                        changed.insert(name.to_string(), value);
                    }
                    Err(_) => invalidated.push(name.to_string()),
                },
                _ => invalidated.push(name.to_string()),
            }
        }
        let mut msg = Message::signal(
            self.path.as_str(),
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
        )?;
        (interface.to_string(), changed, invalidated).append_args(&mut msg)?;
        self.conn.send(msg)?;
        Ok(())
    }
}

// ---- dispatch -----------------------------------------------------------

/// Route an incoming method call to the right table entry and send the
/// reply (or error reply), honoring fire-and-forget calls.
pub(crate) fn dispatch_incoming(conn: &Connection, mut msg: Message) {
    let wants_reply = msg.expects_reply();
    let result = dispatch_call(conn, &mut msg);
    if !wants_reply {
        if let Err(e) = result {
            trace!("no-reply call failed: {}", e);
        }
        return;
    }
    let reply = match result {
        Ok(reply) => reply,
        Err(e) => Message::error_reply(&msg, &e),
    };
    if let Err(e) = conn.send(reply) {
        trace!("could not send reply: {}", e);
    }
}

fn dispatch_call(
    conn: &Connection,
    msg: &mut Message,
) -> std::result::Result<Message, BusError> {
    let path = msg
        .path()
        .ok_or_else(|| BusError::invalid_args("method call without a path"))?
        .to_string();
    let member = msg
        .member()
        .ok_or_else(|| BusError::invalid_args("method call without a member"))?
        .to_string();

    let interface = msg.interface().map(str::to_string);
    match interface.as_deref() {
        Some(PEER_INTERFACE) => return dispatch_peer(msg, &member),
        Some(PROPERTIES_INTERFACE) => return dispatch_properties(conn, msg, &path, &member),
        Some(INTROSPECTABLE_INTERFACE) if member == "Introspect" => {
            let xml = introspect_xml(conn, &path);
            let mut reply = Message::method_return(msg);
            (xml,).append_args(&mut reply).map_err(BusError::from)?;
            return Ok(reply);
        }
        _ => {}
    }

    let table = match interface.as_deref() {
        Some(interface) => conn
            .lookup_interface(&path, interface)
            .ok_or_else(|| {
                if conn.has_path(&path) {
                    BusError::unknown_interface(interface)
                } else {
                    BusError::unknown_object(&path)
                }
            })?,
        // No interface header: take the first registered interface at the
        // path that knows the member.
        None => conn
            .interfaces_at(&path)
            .into_iter()
            .find(|t| t.find_method(&member).is_some())
            .ok_or_else(|| BusError::unknown_method("(any)", &member))?,
    };

    let entry = table
        .find_method(&member)
        .ok_or_else(|| BusError::unknown_method(&table.name, &member))?;
    trace!(path = %path, interface = %table.name, member = %member, "dispatching call");

    let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(msg)));
    match outcome {
        Ok(result) => result,
        Err(_) => Err(BusError::failed(format!(
            "method handler for '{}' panicked",
            member
        ))),
    }
}

fn dispatch_peer(msg: &mut Message, member: &str) -> std::result::Result<Message, BusError> {
    match member {
        "Ping" => Ok(Message::method_return(msg)),
        "GetMachineId" => {
            let mut reply = Message::method_return(msg);
            (machine_id(),).append_args(&mut reply).map_err(BusError::from)?;
            Ok(reply)
        }
        other => Err(BusError::unknown_method(PEER_INTERFACE, other)),
    }
}

fn machine_id() -> String {
    static MACHINE_ID: OnceLock<String> = OnceLock::new();
    MACHINE_ID
        .get_or_init(|| {
            std::fs::read_to_string("/etc/machine-id")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0".repeat(32))
        })
        .clone()
}

fn dispatch_properties(
    conn: &Connection,
    msg: &mut Message,
    path: &str,
    member: &str,
) -> std::result::Result<Message, BusError> {
    let lookup = |interface: &str| {
        conn.lookup_interface(path, interface).ok_or_else(|| {
            if conn.has_path(path) {
                BusError::unknown_interface(interface)
            } else {
                BusError::unknown_object(path)
            }
        })
    };
    match member {
        "Get" => {
            let (interface, property) = <(String, String)>::read_args(msg)
                .map_err(|e| BusError::invalid_args(e.to_string()))?;
            let table = lookup(&interface)?;
            let entry = table
                .find_property(&property)
                .ok_or_else(|| BusError::unknown_property(&interface, &property))?;
            let getter = entry.getter.as_ref().ok_or_else(|| {
                BusError::new_unchecked(
                    ERR_ACCESS_DENIED,
                    format!("property '{}' is write-only", property),
                )
            })?;
            let value = getter()?;
            let mut reply = Message::method_return(msg);
            (value,).append_args(&mut reply).map_err(BusError::from)?;
            Ok(reply)
        }
        "Set" => {
            let (interface, property, value) = <(String, String, Value)>::read_args(msg)
                .map_err(|e| BusError::invalid_args(e.to_string()))?;
            let table = lookup(&interface)?;
            let entry = table
                .find_property(&property)
                .ok_or_else(|| BusError::unknown_property(&interface, &property))?;
            let setter = entry.setter.as_ref().ok_or_else(|| {
                BusError::new_unchecked(
                    ERR_PROPERTY_READ_ONLY,
                    format!("property '{}' is read-only", property),
                )
            })?;
            setter(value)?;
            Ok(Message::method_return(msg))
        }
        "GetAll" => {
            let (interface,) = <(String,)>::read_args(msg)
                .map_err(|e| BusError::invalid_args(e.to_string()))?;
            let table = lookup(&interface)?;
            let mut all: HashMap<String, Value> = HashMap::new();
            for entry in &table.properties {
                // Write-only properties are omitted, per the properties
                // interface contract.
                if let Some(getter) = &entry.getter {
                    let value = getter()?;
                    all.insert(entry.name.clone(), value);
                }
            }
            let mut reply = Message::method_return(msg);
            (all,).append_args(&mut reply).map_err(BusError::from)?;
            Ok(reply)
        }
        other => Err(BusError::unknown_method(PROPERTIES_INTERFACE, other)),
    }
}

// ---- introspection ------------------------------------------------------

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn write_args(
    out: &mut String,
    signature: &str,
    arg_names: &[String],
    direction: Option<&str>,
) {
    let Ok(sigs) = Signature::parse_many(signature) else {
        return;
    };
    for (at, sig) in sigs.iter().enumerate() {
        out.push_str("      <arg");
        if let Some(name) = arg_names.get(at) {
            out.push_str(&format!(" name=\"{}\"", xml_escape(name)));
        }
        out.push_str(&format!(" type=\"{}\"", xml_escape(sig.as_str())));
        if let Some(direction) = direction {
            out.push_str(&format!(" direction=\"{}\"", direction));
        }
        out.push_str("/>\n");
    }
}

/// Introspection XML for one path: every registered interface, the
/// standard interfaces, and child-node stubs.
fn introspect_xml(conn: &Connection, path: &str) -> String {
    let mut out = String::from(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n",
    );
    let mut tables = conn.interfaces_at(path);
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    for table in &tables {
        out.push_str(&format!(
            "  <interface name=\"{}\">\n",
            xml_escape(&table.name)
        ));
        if table.flags.contains(InterfaceFlags::DEPRECATED) {
            out.push_str(
                "    <annotation name=\"org.freedesktop.DBus.Deprecated\" value=\"true\"/>\n",
            );
        }
        for method in &table.methods {
            out.push_str(&format!(
                "    <method name=\"{}\">\n",
                xml_escape(&method.name)
            ));
            write_args(&mut out, &method.input_signature, &method.input_names, Some("in"));
            write_args(
                &mut out,
                &method.output_signature,
                &method.output_names,
                Some("out"),
            );
            out.push_str("    </method>\n");
        }
        for signal in &table.signals {
            out.push_str(&format!(
                "    <signal name=\"{}\">\n",
                xml_escape(&signal.name)
            ));
            write_args(&mut out, &signal.signature, &signal.arg_names, None);
            out.push_str("    </signal>\n");
        }
        for property in &table.properties {
            let access = match (&property.getter, &property.setter) {
                (Some(_), Some(_)) => "readwrite",
                (Some(_), None) => "read",
                _ => "write",
            };
            out.push_str(&format!(
                "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
                xml_escape(&property.name),
                xml_escape(&property.signature),
                access
            ));
        }
        out.push_str("  </interface>\n");
    }
    out.push_str(concat!(
        "  <interface name=\"org.freedesktop.DBus.Peer\">\n",
        "    <method name=\"Ping\"/>\n",
        "    <method name=\"GetMachineId\">\n",
        "      <arg name=\"machine_uuid\" type=\"s\" direction=\"out\"/>\n",
        "    </method>\n",
        "  </interface>\n",
        "  <interface name=\"org.freedesktop.DBus.Properties\">\n",
        "    <method name=\"Get\">\n",
        "      <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n",
        "      <arg name=\"property_name\" type=\"s\" direction=\"in\"/>\n",
        "      <arg name=\"value\" type=\"v\" direction=\"out\"/>\n",
        "    </method>\n",
        "    <method name=\"Set\">\n",
        "      <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n",
        "      <arg name=\"property_name\" type=\"s\" direction=\"in\"/>\n",
        "      <arg name=\"value\" type=\"v\" direction=\"in\"/>\n",
        "    </method>\n",
        "    <method name=\"GetAll\">\n",
        "      <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n",
        "      <arg name=\"properties\" type=\"a{sv}\" direction=\"out\"/>\n",
        "    </method>\n",
        "    <signal name=\"PropertiesChanged\">\n",
        "      <arg name=\"interface_name\" type=\"s\"/>\n",
        "      <arg name=\"changed_properties\" type=\"a{sv}\"/>\n",
        "      <arg name=\"invalidated_properties\" type=\"as\"/>\n",
        "    </signal>\n",
        "  </interface>\n",
        "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n",
        "    <method name=\"Introspect\">\n",
        "      <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n",
        "    </method>\n",
        "  </interface>\n",
    ));
    for child in conn.child_paths(path) {
        out.push_str(&format!("  <node name=\"{}\"/>\n", xml_escape(&child)));
    }
    out.push_str("</node>\n");
    out
}
