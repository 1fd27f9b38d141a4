//! The connection: one transport, one event loop, and the tables that
//! route traffic: pending replies by serial, match rules in registration
//! order, registered interfaces by path.
//!
//! Each connection owns at most one background event-loop thread. All
//! signal callbacks, async-reply completions and server-side handlers run
//! on that thread, cooperatively. A blocking call may be issued from any
//! thread; it shares the transport, so after it drains the socket itself
//! it signals the wake-up descriptor and the sleeping loop re-polls
//! immediately instead of waiting out its computed timeout.

use std::collections::HashMap;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{BusError, Error, Result};
use crate::message::{Message, MessageKind};
use crate::names;
use crate::object::{self, RegisteredInterface};
use crate::transport::{self, BusAddress, BusTransport, Notifier};

/// The bus peer that owns names and matches.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

const SYSTEM_BUS_PATH: &str = "/var/run/dbus/system_bus_socket";

/// Applied when a call specifies no timeout of its own.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

pub(crate) type ReplyCallback = Box<dyn FnOnce(Result<Message>) + Send>;

struct PendingReply {
    deadline: Instant,
    complete: ReplyCallback,
}

/// What an inbound message must look like for a match rule to fire.
#[derive(Debug, Clone, Default)]
pub struct MatchSpec {
    pub kind: Option<MessageKind>,
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl MatchSpec {
    /// The canonical rule for one signal.
    pub fn signal(path: &str, interface: &str, member: &str) -> MatchSpec {
        MatchSpec {
            kind: Some(MessageKind::Signal),
            sender: None,
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
        }
    }

    fn matches(&self, msg: &Message) -> bool {
        fn field(want: &Option<String>, got: Option<&str>) -> bool {
            match want {
                Some(want) => got == Some(want.as_str()),
                None => true,
            }
        }
        self.kind.map(|k| k == msg.kind()).unwrap_or(true)
            && field(&self.sender, msg.sender())
            && field(&self.path, msg.path())
            && field(&self.interface, msg.interface())
            && field(&self.member, msg.member())
    }

    /// The textual rule sent to the bus daemon.
    fn to_rule_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(kind) = self.kind {
            let name = match kind {
                MessageKind::MethodCall => "method_call",
                MessageKind::MethodReturn => "method_return",
                MessageKind::Error => "error",
                MessageKind::Signal => "signal",
            };
            parts.push(format!("type='{}'", name));
        }
        if let Some(v) = &self.sender {
            parts.push(format!("sender='{}'", v));
        }
        if let Some(v) = &self.path {
            parts.push(format!("path='{}'", v));
        }
        if let Some(v) = &self.interface {
            parts.push(format!("interface='{}'", v));
        }
        if let Some(v) = &self.member {
            parts.push(format!("member='{}'", v));
        }
        parts.join(",")
    }
}

struct MatchRule {
    id: u64,
    spec: MatchSpec,
    handler: Arc<dyn Fn(&Message) + Send + Sync>,
}

/// Owner handle for a registered match rule; dropping it removes the rule.
#[must_use = "dropping the guard removes the match rule"]
pub struct MatchGuard {
    conn: Weak<ConnectionInner>,
    id: u64,
}

impl Drop for MatchGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.conn.upgrade() {
            inner.remove_match(self.id);
        }
    }
}

struct LoopState {
    handle: Option<JoinHandle<()>>,
    thread_id: Option<thread::ThreadId>,
}

pub(crate) struct ConnectionInner {
    transport: Mutex<BusTransport>,
    transport_fd: RawFd,
    wake: Notifier,
    exit: Notifier,
    serial: AtomicU32,
    is_bus: bool,
    unique_name: Mutex<Option<String>>,
    default_timeout: Mutex<Duration>,
    pending: Mutex<HashMap<u32, PendingReply>>,
    rules: Mutex<Vec<MatchRule>>,
    next_rule_id: AtomicU64,
    objects: RwLock<HashMap<String, HashMap<String, Arc<RegisteredInterface>>>>,
    loop_state: Mutex<LoopState>,
    loop_running: AtomicBool,
    closed: AtomicBool,
}

/// A connection to a message bus or to a direct peer.
///
/// Cheap to clone; all clones share the transport, the event loop and the
/// routing tables. The last clone to drop leaves the event loop, fails
/// every pending call, releases the floating match rules and then the
/// transport, in that order.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("is_bus", &self.inner.is_bus)
            .finish_non_exhaustive()
    }
}

impl Connection {
    // ---- open strategies ----------------------------------------------

    /// Connect to the default bus: the session bus if the environment
    /// names one, the system bus otherwise.
    pub fn open() -> Result<Connection> {
        match std::env::var("DBUS_SESSION_BUS_ADDRESS") {
            Ok(addr) => Self::open_session_at(&addr),
            Err(_) => Self::open_system(),
        }
    }

    /// Connect to the system bus.
    pub fn open_system() -> Result<Connection> {
        let address = std::env::var("DBUS_SYSTEM_BUS_ADDRESS")
            .unwrap_or_else(|_| format!("unix:path={}", SYSTEM_BUS_PATH));
        Self::open_bus(&address)
    }

    /// Connect to the session bus named by the environment.
    pub fn open_session() -> Result<Connection> {
        let address = std::env::var("DBUS_SESSION_BUS_ADDRESS")
            .map_err(|_| Error::InvalidAddress("DBUS_SESSION_BUS_ADDRESS is not set".into()))?;
        Self::open_bus(&address)
    }

    /// Connect to a session bus at an explicit address.
    pub fn open_session_at(address: &str) -> Result<Connection> {
        Self::open_bus(address)
    }

    /// Connect to a bus on a remote host over TCP.
    pub fn open_remote(host: &str, port: u16) -> Result<Connection> {
        Self::open_bus(&format!("tcp:host={},port={}", host, port))
    }

    fn open_bus(address: &str) -> Result<Connection> {
        let stream = BusAddress::parse(address)?.connect()?;
        let conn = Self::from_transport(BusTransport::new(stream)?, true)?;
        conn.hello()?;
        Ok(conn)
    }

    /// Connect directly to a peer (no bus daemon) at an address.
    pub fn open_direct(address: &str) -> Result<Connection> {
        let stream = BusAddress::parse(address)?.connect()?;
        Self::from_transport(BusTransport::new(stream)?, false)
    }

    /// Adopt an already-connected descriptor as a direct client
    /// connection. Takes ownership of the descriptor.
    pub fn open_direct_fd(fd: RawFd) -> Result<Connection> {
        Self::from_transport(BusTransport::new(transport::stream_from_fd(fd))?, false)
    }

    /// Adopt an already-accepted descriptor as the serving end of a
    /// direct connection. Takes ownership of the descriptor.
    pub fn open_server_fd(fd: RawFd) -> Result<Connection> {
        // Direct connections are symmetric once the handshake is done.
        Self::from_transport(BusTransport::new(transport::stream_from_fd(fd))?, false)
    }

    /// Adopt a connected stream as a direct client connection.
    pub fn open_direct_stream(stream: Box<dyn crate::stream::Stream>) -> Result<Connection> {
        Self::from_transport(BusTransport::new(stream)?, false)
    }

    /// Adopt an accepted stream (e.g. from a [`Listener`](crate::Listener))
    /// as the serving end of a direct connection.
    pub fn open_server_stream(stream: Box<dyn crate::stream::Stream>) -> Result<Connection> {
        Self::from_transport(BusTransport::new(stream)?, false)
    }

    /// A connected pair of direct peers over a socket pair. The first
    /// element plays the client role, the second the server role.
    pub fn pair() -> Result<(Connection, Connection)> {
        let (a, b) = UnixStream::pair()?;
        let client = Connection::open_direct_fd(a.into_raw_fd())?;
        let server = Connection::open_server_fd(b.into_raw_fd())?;
        Ok((client, server))
    }

    fn from_transport(transport: BusTransport, is_bus: bool) -> Result<Connection> {
        let transport_fd = transport.fd();
        let inner = Arc::new(ConnectionInner {
            transport: Mutex::new(transport),
            transport_fd,
            wake: Notifier::new()?,
            exit: Notifier::new()?,
            serial: AtomicU32::new(1),
            is_bus,
            unique_name: Mutex::new(None),
            default_timeout: Mutex::new(DEFAULT_CALL_TIMEOUT),
            pending: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            next_rule_id: AtomicU64::new(1),
            objects: RwLock::new(HashMap::new()),
            loop_state: Mutex::new(LoopState {
                handle: None,
                thread_id: None,
            }),
            loop_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok(Connection { inner })
    }

    /// The name-acquisition handshake with the bus daemon; flushes the
    /// connection and records our unique name.
    fn hello(&self) -> Result<()> {
        let msg = Message::method_call(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "Hello")?;
        let mut reply = self.call_method(msg, None)?;
        let name = reply.read_str()?;
        *self.inner.unique_name.lock().expect("lock poisoned") = Some(name);
        Ok(())
    }

    // ---- identity ------------------------------------------------------

    /// True when connected through a bus daemon rather than to a direct
    /// peer.
    pub fn is_bus(&self) -> bool {
        self.inner.is_bus
    }

    /// Our unique connection name, once the bus has assigned one.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.lock().expect("lock poisoned").clone()
    }

    /// Replace the default method-call timeout.
    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.inner.default_timeout.lock().expect("lock poisoned") = timeout;
    }

    pub fn default_timeout(&self) -> Duration {
        *self.inner.default_timeout.lock().expect("lock poisoned")
    }

    // ---- names ---------------------------------------------------------

    /// Ask the bus for a well-known name. Fails on direct connections.
    pub fn request_name(&self, name: &str) -> Result<()> {
        names::ensure_bus_name(name)?;
        if !self.inner.is_bus {
            return Err(Error::NotABus);
        }
        let mut msg = Message::method_call(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "RequestName")?;
        use crate::codec::ArgList;
        (name.to_string(), 0u32).append_args(&mut msg)?;
        let mut reply = self.call_method(msg, None)?;
        let code = reply.read_u32()?;
        // 1 = became primary owner, 4 = already the owner.
        if code == 1 || code == 4 {
            Ok(())
        } else {
            Err(BusError::new_unchecked(
                crate::error::ERR_ACCESS_DENIED,
                format!("could not acquire name '{}' (result {})", name, code),
            )
            .into())
        }
    }

    /// Give a well-known name back to the bus.
    pub fn release_name(&self, name: &str) -> Result<()> {
        names::ensure_bus_name(name)?;
        if !self.inner.is_bus {
            return Err(Error::NotABus);
        }
        let mut msg = Message::method_call(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "ReleaseName")?;
        use crate::codec::ArgList;
        (name.to_string(),).append_args(&mut msg)?;
        let mut reply = self.call_method(msg, None)?;
        let _code = reply.read_u32()?;
        Ok(())
    }

    // ---- sending -------------------------------------------------------

    /// Send a message that expects no reply (signals, oneway calls,
    /// replies). Returns the assigned serial.
    pub fn send(&self, msg: Message) -> Result<u32> {
        self.inner.send_message(msg)
    }

    /// Issue a method call and register a completion for its reply.
    ///
    /// The completion receives the reply message (success *or* error
    /// reply) or a locally synthesized failure (timeout, connection
    /// closed); it runs on the event-loop thread. Returns the call serial.
    pub(crate) fn send_with_reply(
        &self,
        msg: Message,
        timeout: Option<Duration>,
        complete: ReplyCallback,
    ) -> Result<u32> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if !msg.expects_reply() {
            return Err(Error::Decode(
                "cannot await a reply to a no-reply message".to_string(),
            ));
        }
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let deadline = Instant::now() + timeout;
        let mut msg = msg;
        let serial = inner.assign_serial(&mut msg);
        // Register before sending: the event loop may pick the reply off
        // the socket between our write and any later registration.
        inner.pending.lock().expect("lock poisoned").insert(
            serial,
            PendingReply {
                deadline,
                complete,
            },
        );
        if let Err(e) = inner.write_message(&msg) {
            let _ = inner.pending.lock().expect("lock poisoned").remove(&serial);
            return Err(e);
        }
        // The sleeping loop computed its poll timeout before this call
        // existed; wake it so the new deadline is taken into account.
        if inner.loop_running.load(Ordering::SeqCst) {
            inner.wake.notify();
        }
        Ok(serial)
    }

    pub(crate) fn cancel_pending(&self, serial: u32) -> bool {
        self.inner
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(&serial)
            .is_some()
    }

    /// Send a method call and block the calling thread until the reply
    /// arrives or the timeout passes.
    ///
    /// While the event loop is running, this parks on the completion and
    /// lets the loop route the reply. With no loop running (or when called
    /// from the loop thread itself), the caller pumps the transport,
    /// dispatching whatever else arrives, and finally wakes the loop if
    /// messages are left queued.
    pub fn call_method(&self, msg: Message, timeout: Option<Duration>) -> Result<Message> {
        let inner = self.inner.clone();
        let slot = Arc::new(SyncSlot::default());
        let slot2 = slot.clone();
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let deadline = Instant::now() + timeout;
        self.send_with_reply(
            msg,
            Some(timeout),
            Box::new(move |result| slot2.fill(result)),
        )?;

        loop {
            if let Some(result) = slot.take() {
                inner.kick_if_queued();
                return finish_reply(result);
            }
            let now = Instant::now();
            if now >= deadline {
                // Lost the race against completion? Collect it; otherwise
                // the deadline sweep below settles the slot.
                inner.expire_pending();
                if let Some(result) = slot.take() {
                    inner.kick_if_queued();
                    return finish_reply(result);
                }
                continue;
            }
            let remaining = deadline - now;
            let slice = remaining.min(Duration::from_millis(100));
            let on_loop_thread = {
                let state = inner.loop_state.lock().expect("lock poisoned");
                state.thread_id == Some(thread::current().id())
            };
            if inner.loop_running.load(Ordering::SeqCst) && !on_loop_thread {
                slot.wait(slice);
            } else {
                pump_once(&inner, slice)?;
            }
        }
    }

    // ---- match rules ----------------------------------------------------

    /// Register a match rule with a handler. Handlers fire on the
    /// event-loop thread, in registration order. The rule lives until the
    /// returned guard is dropped.
    pub fn add_match(
        &self,
        spec: MatchSpec,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<MatchGuard> {
        let id = self.inner.install_match(spec, Arc::new(handler), false)?;
        Ok(MatchGuard {
            conn: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Register a match rule owned by the connection itself; it is
    /// released when the connection closes.
    pub fn add_match_floating(
        &self,
        spec: MatchSpec,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.install_match(spec, Arc::new(handler), true)?;
        Ok(())
    }

    // ---- event loop -----------------------------------------------------

    /// Launch the background event loop. Idempotent: a second call while
    /// the loop is running does nothing.
    pub fn enter_event_loop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let mut state = inner.loop_state.lock().expect("lock poisoned");
        if inner.loop_running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A previous loop may have exited on its own; reap it.
        if let Some(handle) = state.handle.take() {
            let _ = handle.join();
        }
        let weak = Arc::downgrade(inner);
        inner.loop_running.store(true, Ordering::SeqCst);
        inner.exit.drain();
        let handle = match thread::Builder::new()
            .name("bus-event-loop".to_string())
            .spawn(move || event_loop(weak))
        {
            Ok(handle) => handle,
            Err(e) => {
                inner.loop_running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        state.thread_id = Some(handle.thread().id());
        state.handle = Some(handle);
        debug!("event loop started");
        Ok(())
    }

    /// Signal the loop-exit descriptor and join the background thread.
    ///
    /// Called from a handler running on the loop thread itself, this only
    /// signals the exit; the loop winds down after the handler returns.
    pub fn leave_event_loop(&self) -> Result<()> {
        let (handle, on_loop_thread) = {
            let mut state = self.inner.loop_state.lock().expect("lock poisoned");
            self.inner.exit.notify();
            let on_loop_thread = state.thread_id == Some(thread::current().id());
            state.thread_id = None;
            (state.handle.take(), on_loop_thread)
        };
        if let Some(handle) = handle {
            if on_loop_thread {
                // Joining ourselves would deadlock; detach instead.
                drop(handle);
            } else {
                handle
                    .join()
                    .map_err(|_| Error::Decode("event loop panicked".to_string()))?;
            }
        }
        Ok(())
    }

    /// True while the background event loop is running.
    pub fn event_loop_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::SeqCst)
    }

    /// False once the transport has failed or the peer has gone away;
    /// every further call on a closed connection errors.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    // ---- object registry ------------------------------------------------

    pub(crate) fn register_interface(
        &self,
        path: &str,
        interface: &str,
        table: Arc<RegisteredInterface>,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        let mut objects = self.inner.objects.write().expect("lock poisoned");
        objects
            .entry(path.to_string())
            .or_default()
            .insert(interface.to_string(), table);
        Ok(())
    }

    /// Remove a registration, but only the exact table the caller
    /// registered; a replacement stays untouched.
    pub(crate) fn unregister_interface(&self, path: &str, interface: &str, table_id: u64) {
        let mut objects = self.inner.objects.write().expect("lock poisoned");
        if let Some(interfaces) = objects.get_mut(path) {
            if interfaces.get(interface).map(|t| t.id()) == Some(table_id) {
                interfaces.remove(interface);
                if interfaces.is_empty() {
                    objects.remove(path);
                }
            }
        }
    }

    pub(crate) fn lookup_interface(
        &self,
        path: &str,
        interface: &str,
    ) -> Option<Arc<RegisteredInterface>> {
        self.inner
            .objects
            .read()
            .expect("lock poisoned")
            .get(path)?
            .get(interface)
            .cloned()
    }

    pub(crate) fn interfaces_at(&self, path: &str) -> Vec<Arc<RegisteredInterface>> {
        self.inner
            .objects
            .read()
            .expect("lock poisoned")
            .get(path)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn has_path(&self, path: &str) -> bool {
        self.inner
            .objects
            .read()
            .expect("lock poisoned")
            .contains_key(path)
    }

    /// Registered paths strictly below `prefix`, for introspection child
    /// nodes.
    pub(crate) fn child_paths(&self, prefix: &str) -> Vec<String> {
        let objects = self.inner.objects.read().expect("lock poisoned");
        let base = if prefix == "/" {
            String::from("/")
        } else {
            format!("{}/", prefix)
        };
        let mut children: Vec<String> = objects
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(&base)?;
                let first = rest.split('/').next()?;
                if first.is_empty() {
                    None
                } else {
                    Some(first.to_string())
                }
            })
            .collect();
        children.sort();
        children.dedup();
        children
    }
}

/// One blocking caller's reply slot.
#[derive(Default)]
struct SyncSlot {
    result: Mutex<Option<Result<Message>>>,
    cond: Condvar,
}

impl SyncSlot {
    fn fill(&self, result: Result<Message>) {
        *self.result.lock().expect("lock poisoned") = Some(result);
        self.cond.notify_all();
    }

    fn take(&self) -> Option<Result<Message>> {
        self.result.lock().expect("lock poisoned").take()
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.result.lock().expect("lock poisoned");
        if guard.is_some() {
            return;
        }
        let _ = self
            .cond
            .wait_timeout(guard, timeout)
            .expect("lock poisoned");
    }
}

/// Convert a completed reply into the caller-facing result: an error
/// reply becomes [`Error::Remote`] with its symbolic name and message.
pub(crate) fn finish_reply(result: Result<Message>) -> Result<Message> {
    let msg = result?;
    if msg.kind() == MessageKind::Error {
        let err = msg
            .to_bus_error()
            .unwrap_or_else(|| BusError::failed("error reply without a name"));
        return Err(err.into());
    }
    Ok(msg)
}

impl ConnectionInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn assign_serial(&self, msg: &mut Message) -> u32 {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        msg.set_serial(serial);
        if msg.sender().is_none() {
            if let Some(name) = self.unique_name.lock().expect("lock poisoned").clone() {
                msg.set_sender(Some(name));
            }
        }
        serial
    }

    fn write_message(&self, msg: &Message) -> Result<()> {
        let mut transport = self.transport.lock().expect("lock poisoned");
        let result = transport.send(msg);
        if result.is_err() {
            drop(transport);
            self.mark_closed();
        }
        result
    }

    pub(crate) fn send_message(&self, mut msg: Message) -> Result<u32> {
        self.ensure_open()?;
        let serial = self.assign_serial(&mut msg);
        self.write_message(&msg)?;
        Ok(serial)
    }

    fn install_match(
        &self,
        spec: MatchSpec,
        handler: Arc<dyn Fn(&Message) + Send + Sync>,
        floating: bool,
    ) -> Result<u64> {
        self.ensure_open()?;
        if let Some(path) = &spec.path {
            names::ensure_object_path(path)?;
        }
        if let Some(interface) = &spec.interface {
            names::ensure_interface_name(interface)?;
        }
        if let Some(member) = &spec.member {
            names::ensure_member_name(member)?;
        }
        let id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        self.rules.lock().expect("lock poisoned").push(MatchRule {
            id,
            spec: spec.clone(),
            handler,
        });
        if self.is_bus {
            // Forward the subscription to the daemon; local filtering
            // still applies when it fans traffic back to us.
            if let Ok(mut msg) =
                Message::method_call(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "AddMatch")
            {
                use crate::codec::ArgList;
                msg.set_flags(crate::message::MessageFlags::NO_REPLY_EXPECTED);
                let _ = (spec.to_rule_string(),).append_args(&mut msg);
                let _ = self.send_message(msg);
            }
        }
        trace!(id, floating, "match rule installed");
        Ok(id)
    }

    fn remove_match(&self, id: u64) {
        let removed_spec = {
            let mut rules = self.rules.lock().expect("lock poisoned");
            let at = rules.iter().position(|r| r.id == id);
            at.map(|at| rules.remove(at).spec)
        };
        if let Some(spec) = removed_spec {
            if self.is_bus && !self.closed.load(Ordering::SeqCst) {
                if let Ok(mut msg) =
                    Message::method_call(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "RemoveMatch")
                {
                    use crate::codec::ArgList;
                    msg.set_flags(crate::message::MessageFlags::NO_REPLY_EXPECTED);
                    let _ = (spec.to_rule_string(),).append_args(&mut msg);
                    let _ = self.send_message(msg);
                }
            }
        }
    }

    /// If inbound messages are queued, make sure the sleeping event loop
    /// notices them now rather than after its computed timeout.
    fn kick_if_queued(&self) {
        let queued = self
            .transport
            .lock()
            .expect("lock poisoned")
            .queued();
        if queued > 0 && self.loop_running.load(Ordering::SeqCst) {
            self.wake.notify();
        }
    }

    /// Fail every pending call whose deadline has passed, through the
    /// normal completion path.
    fn expire_pending(&self) {
        let now = Instant::now();
        let expired: Vec<(u32, PendingReply)> = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            let serials: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(s, _)| *s)
                .collect();
            serials
                .into_iter()
                .filter_map(|s| pending.remove(&s).map(|p| (s, p)))
                .collect()
        };
        for (serial, pending) in expired {
            debug!(serial, "pending call timed out");
            (pending.complete)(Err(BusError::timeout().into()));
        }
    }

    /// Milliseconds until the earliest pending deadline; -1 for "no
    /// deadline".
    fn next_timeout_ms(&self) -> i32 {
        let pending = self.pending.lock().expect("lock poisoned");
        let Some(deadline) = pending.values().map(|p| p.deadline).min() else {
            return -1;
        };
        let now = Instant::now();
        if deadline <= now {
            0
        } else {
            (deadline - now).as_millis().min(i32::MAX as u128) as i32
        }
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("connection closed; failing pending calls");
        let pending = std::mem::take(&mut *self.pending.lock().expect("lock poisoned"));
        for (_, p) in pending {
            (p.complete)(Err(Error::ConnectionClosed));
        }
        self.wake.notify();
    }
}

/// Read what the socket has, then process a single queued message. Used
/// by blocking callers when no event loop runs on this connection.
fn pump_once(inner: &Arc<ConnectionInner>, wait: Duration) -> Result<()> {
    let queued = inner.transport.lock().expect("lock poisoned").queued();
    if queued == 0 {
        let ms = wait.as_millis().min(i32::MAX as u128) as i32;
        if !transport::wait_readable(inner.transport_fd, ms)? {
            inner.expire_pending();
            return Ok(());
        }
        let mut transport = inner.transport.lock().expect("lock poisoned");
        match transport.read_pending() {
            Ok(_) => {}
            Err(e) => {
                drop(transport);
                inner.mark_closed();
                return Err(e);
            }
        }
    }
    let msg = inner.transport.lock().expect("lock poisoned").pop_inbound();
    if let Some(msg) = msg {
        process_inbound(inner, msg);
    }
    inner.expire_pending();
    Ok(())
}

/// Route one inbound message: replies to their pending completion, calls
/// to the dispatch tables, signals to the match rules.
fn process_inbound(inner: &Arc<ConnectionInner>, msg: Message) {
    match msg.kind() {
        MessageKind::MethodReturn | MessageKind::Error => {
            let Some(serial) = msg.reply_serial() else {
                warn!("reply without a reply serial");
                return;
            };
            let entry = inner.pending.lock().expect("lock poisoned").remove(&serial);
            match entry {
                Some(pending) => (pending.complete)(Ok(msg)),
                // A cancelled or timed-out call; nothing left to do.
                None => trace!(serial, "reply for a vacated call"),
            }
        }
        MessageKind::MethodCall => {
            let conn = Connection {
                inner: inner.clone(),
            };
            object::dispatch_incoming(&conn, msg);
        }
        MessageKind::Signal => {
            let handlers: Vec<Arc<dyn Fn(&Message) + Send + Sync>> = {
                let rules = inner.rules.lock().expect("lock poisoned");
                rules
                    .iter()
                    .filter(|r| r.spec.matches(&msg))
                    .map(|r| r.handler.clone())
                    .collect()
            };
            for handler in handlers {
                // A panicking handler must not take the loop down.
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&msg)));
                if outcome.is_err() {
                    warn!("signal handler panicked");
                }
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Children before self: stop the loop, fail callers, drop rules,
        // then release the transport.
        self.exit.notify();
        let handle = self
            .loop_state
            .get_mut()
            .expect("lock poisoned")
            .handle
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        let pending = std::mem::take(self.pending.get_mut().expect("lock poisoned"));
        for (_, p) in pending {
            (p.complete)(Err(Error::ConnectionClosed));
        }
        self.rules.get_mut().expect("lock poisoned").clear();
        self.transport.get_mut().expect("lock poisoned").shutdown();
    }
}

/// The background loop: process one pending event, then block in a
/// multiplexed wait over the transport, wake and exit descriptors.
///
/// The loop holds only a weak reference between events, so dropping the
/// last user handle tears the connection down even while the loop sleeps.
fn event_loop(weak: Weak<ConnectionInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        // Process one pending protocol event.
        let msg = inner.transport.lock().expect("lock poisoned").pop_inbound();
        if let Some(msg) = msg {
            process_inbound(&inner, msg);
        }
        inner.expire_pending();

        let queued = inner.transport.lock().expect("lock poisoned").queued();
        let timeout = if queued > 0 { 0 } else { inner.next_timeout_ms() };
        let transport_fd = inner.transport_fd;
        let wake_fd = inner.wake.read_fd();
        let exit_fd = inner.exit.read_fd();
        if inner.closed.load(Ordering::SeqCst) {
            inner.loop_running.store(false, Ordering::SeqCst);
            return;
        }
        drop(inner);

        let mut fds = [
            libc::pollfd {
                fd: transport_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: exit_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        if transport::poll(&mut fds, timeout).is_err() {
            if let Some(inner) = weak.upgrade() {
                inner.loop_running.store(false, Ordering::SeqCst);
            }
            return;
        }
        let transport_ready = fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
        let wake_ready = fds[1].revents & libc::POLLIN != 0;
        let exit_ready = fds[2].revents & libc::POLLIN != 0;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if exit_ready {
            inner.exit.drain();
            inner.loop_running.store(false, Ordering::SeqCst);
            debug!("event loop left");
            return;
        }
        if wake_ready {
            inner.wake.drain();
        }
        if transport_ready {
            let result = inner.transport.lock().expect("lock poisoned").read_pending();
            if let Err(e) = result {
                trace!("transport read failed: {}", e);
                inner.mark_closed();
                inner.loop_running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}
