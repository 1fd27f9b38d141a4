//! The client side: typed calls against a remote object.
//!
//! Three call styles share one primitive (send plus pending-reply
//! registration on the connection):
//!
//! - [`Proxy::call`] blocks the calling thread until the reply or the
//!   timeout;
//! - [`Proxy::call_async_cb`] returns immediately with a non-owning
//!   [`PendingAsyncCall`] observer and delivers the outcome to a callback
//!   on the event-loop thread;
//! - [`Proxy::call_async`] (tokio feature) suspends the calling task and
//!   propagates a remote error as the future's failure.
//!
//! The proxy owns its in-flight calls: they live in a generation-counted
//! slot table, and dropping the proxy forcibly finalizes them: the
//! pending-reply resource is released and the callback is never invoked.
//! The observer handle holds only a slot key; cancel and is-pending on a
//! vacated or recycled slot are inert no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::trace;

use crate::codec::ArgList;
use crate::connection::{finish_reply, Connection, MatchGuard, MatchSpec};
use crate::error::Result;
use crate::message::{Message, MessageFlags};
use crate::names;
use crate::object::PROPERTIES_INTERFACE;
use crate::value::{ObjectPath, Value};

struct CallSlot {
    serial: AtomicU32,
    /// Transitions false to true exactly once; the winner of the
    /// reply/cancel race does the finalizing work.
    finished: AtomicBool,
}

/// The floating-calls set: a generation-counted slot map, so stale
/// observer handles can never reach a recycled slot.
struct CallTable {
    slots: Vec<Option<Arc<CallSlot>>>,
    generations: Vec<u64>,
    free: Vec<usize>,
}

impl CallTable {
    fn new() -> CallTable {
        CallTable {
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
        }
    }

    fn allocate(&mut self, slot: Arc<CallSlot>) -> (usize, u64) {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                (index, self.generations[index])
            }
            None => {
                self.slots.push(Some(slot));
                self.generations.push(0);
                (self.slots.len() - 1, 0)
            }
        }
    }

    fn get(&self, index: usize, generation: u64) -> Option<Arc<CallSlot>> {
        if self.generations.get(index) != Some(&generation) {
            return None;
        }
        self.slots.get(index)?.clone()
    }

    /// Remove the slot if the generation still matches; at most one
    /// caller ever succeeds for a given call.
    fn vacate(&mut self, index: usize, generation: u64) -> bool {
        if self.generations.get(index) != Some(&generation) {
            return false;
        }
        if self.slots[index].take().is_none() {
            return false;
        }
        self.generations[index] += 1;
        self.free.push(index);
        true
    }
}

/// Non-owning observer for an issued asynchronous call.
///
/// `is_pending` stays true from issue until the completion callback has
/// fully returned. Cancelling after the proxy or the call itself is gone
/// is a safe no-op, as is cancelling twice.
#[derive(Clone)]
pub struct PendingAsyncCall {
    conn: Weak<crate::connection::ConnectionInner>,
    table: Weak<Mutex<CallTable>>,
    index: usize,
    generation: u64,
}

impl PendingAsyncCall {
    /// True until the reply callback has been invoked and returned (or
    /// the call was cancelled). A reply that has arrived but whose
    /// handler is still running counts as pending.
    pub fn is_pending(&self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let table = table.lock().expect("lock poisoned");
        table.get(self.index, self.generation).is_some()
    }

    /// Cancel the call: release the pending-reply resource and drop the
    /// callback uninvoked. Racing with an already-dispatched reply is
    /// safe; whoever flips the finished flag first finalizes.
    pub fn cancel(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.lock().expect("lock poisoned");
        let Some(slot) = table.get(self.index, self.generation) else {
            return;
        };
        if slot
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // The reply beat us to it; completion owns the finalization.
            return;
        }
        table.vacate(self.index, self.generation);
        drop(table);
        if let Some(inner) = self.conn.upgrade() {
            let conn = Connection { inner };
            conn.cancel_pending(slot.serial.load(Ordering::SeqCst));
        }
        trace!("pending call cancelled");
    }
}

/// A typed handle to one remote object: destination, path and a default
/// timeout, plus the floating set of in-flight asynchronous calls.
pub struct Proxy {
    conn: Connection,
    destination: Option<String>,
    path: ObjectPath,
    timeout: Option<Duration>,
    calls: Arc<Mutex<CallTable>>,
}

impl Proxy {
    /// Create a proxy for an object at `path`, owned by `destination` (a
    /// bus name; `None` on direct connections).
    pub fn new(conn: &Connection, destination: Option<&str>, path: &str) -> Result<Proxy> {
        if let Some(destination) = destination {
            names::ensure_bus_name(destination)?;
        }
        Ok(Proxy {
            conn: conn.clone(),
            destination: destination.map(str::to_string),
            path: ObjectPath::new(path)?,
            timeout: None,
            calls: Arc::new(Mutex::new(CallTable::new())),
        })
    }

    /// Override the connection's default call timeout for this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Proxy {
        self.timeout = Some(timeout);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    fn build_call<A: ArgList>(&self, interface: &str, member: &str, args: A) -> Result<Message> {
        let mut msg = Message::method_call(
            self.destination.as_deref(),
            self.path.as_str(),
            interface,
            member,
        )?;
        args.append_args(&mut msg)?;
        Ok(msg)
    }

    /// Call a method and block until its reply, decoding the outputs.
    pub fn call<A: ArgList, R: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
    ) -> Result<R> {
        self.call_with_timeout(interface, member, args, self.timeout)
    }

    /// Blocking call with an explicit per-call timeout.
    pub fn call_with_timeout<A: ArgList, R: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
        timeout: Option<Duration>,
    ) -> Result<R> {
        let msg = self.build_call(interface, member, args)?;
        let mut reply = self.conn.call_method(msg, timeout)?;
        R::read_args(&mut reply)
    }

    /// Fire-and-forget call: no reply is requested and none is awaited.
    pub fn call_noreply<A: ArgList>(&self, interface: &str, member: &str, args: A) -> Result<()> {
        let mut msg = self.build_call(interface, member, args)?;
        msg.set_flags(msg.flags() | MessageFlags::NO_REPLY_EXPECTED);
        self.conn.send(msg)?;
        Ok(())
    }

    /// Callback-style call: returns immediately; `callback` runs on the
    /// event-loop thread with the decoded outcome (an error reply arrives
    /// as `Err`). The returned observer can cancel the call or query
    /// whether it is still pending.
    pub fn call_async_cb<A: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
        timeout: Option<Duration>,
        callback: impl FnOnce(Result<Message>) + Send + 'static,
    ) -> Result<PendingAsyncCall> {
        let msg = self.build_call(interface, member, args)?;
        let slot = Arc::new(CallSlot {
            serial: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        });
        let (index, generation) = self
            .calls
            .lock()
            .expect("lock poisoned")
            .allocate(slot.clone());

        let table_weak = Arc::downgrade(&self.calls);
        let slot_for_completion = slot.clone();
        let complete = Box::new(move |result: Result<Message>| {
            if slot_for_completion
                .finished
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Cancelled while the reply was in flight.
                return;
            }
            callback(finish_reply(result));
            // Vacated only after the callback fully returned: observers
            // report pending while the handler is still running.
            if let Some(table) = table_weak.upgrade() {
                table
                    .lock()
                    .expect("lock poisoned")
                    .vacate(index, generation);
            }
        });

        let timeout = timeout.or(self.timeout);
        match self.conn.send_with_reply(msg, timeout, complete) {
            Ok(serial) => {
                slot.serial.store(serial, Ordering::SeqCst);
                Ok(PendingAsyncCall {
                    conn: Arc::downgrade(&self.conn.inner),
                    table: Arc::downgrade(&self.calls),
                    index,
                    generation,
                })
            }
            Err(e) => {
                self.calls
                    .lock()
                    .expect("lock poisoned")
                    .vacate(index, generation);
                Err(e)
            }
        }
    }

    /// Task-style call: suspends the calling task until the reply, the
    /// timeout or a remote error, without blocking the thread.
    #[cfg(feature = "tokio")]
    pub async fn call_async<A: ArgList, R: ArgList>(
        &self,
        interface: &str,
        member: &str,
        args: A,
    ) -> Result<R> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _observer = self.call_async_cb(interface, member, args, None, move |result| {
            let _ = tx.send(result);
        })?;
        match rx.await {
            Ok(result) => {
                let mut reply = result?;
                R::read_args(&mut reply)
            }
            // The proxy (and with it the call) went away mid-flight.
            Err(_) => Err(crate::error::Error::ConnectionClosed),
        }
    }

    /// Subscribe to a signal of this proxy's object. Handlers run on the
    /// event-loop thread and fire in registration order; dropping the
    /// returned guard unsubscribes.
    pub fn match_signal(
        &self,
        interface: &str,
        member: &str,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<MatchGuard> {
        names::ensure_interface_name(interface)?;
        names::ensure_member_name(member)?;
        let spec = MatchSpec::signal(self.path.as_str(), interface, member);
        self.conn.add_match(spec, handler)
    }

    /// Read a property through the standard properties interface.
    pub fn get_property(&self, interface: &str, name: &str) -> Result<Value> {
        let (value,) =
            self.call::<_, (Value,)>(PROPERTIES_INTERFACE, "Get", (interface.to_string(), name.to_string()))?;
        Ok(value)
    }

    /// Write a property through the standard properties interface.
    pub fn set_property(&self, interface: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        self.call::<_, ()>(
            PROPERTIES_INTERFACE,
            "Set",
            (interface.to_string(), name.to_string(), value.into()),
        )
    }

    /// Read every readable property of one interface.
    pub fn get_all_properties(&self, interface: &str) -> Result<HashMap<String, Value>> {
        let (all,) = self.call::<_, (HashMap<String, Value>,)>(
            PROPERTIES_INTERFACE,
            "GetAll",
            (interface.to_string(),),
        )?;
        Ok(all)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        // Forcibly finalize in-flight calls: release their pending-reply
        // resources; callbacks are not invoked.
        let slots: Vec<Arc<CallSlot>> = {
            let mut table = self.calls.lock().expect("lock poisoned");
            let taken: Vec<Arc<CallSlot>> = table
                .slots
                .iter_mut()
                .filter_map(|slot| slot.take())
                .collect();
            for generation in table.generations.iter_mut() {
                *generation += 1;
            }
            taken
        };
        for slot in slots {
            if slot
                .finished
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.conn.cancel_pending(slot.serial.load(Ordering::SeqCst));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Arc<CallSlot> {
        Arc::new(CallSlot {
            serial: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        })
    }

    #[test]
    fn slot_table_recycles_with_fresh_generations() {
        let mut table = CallTable::new();
        let (i0, g0) = table.allocate(slot());
        assert!(table.get(i0, g0).is_some());
        assert!(table.vacate(i0, g0));
        // Stale key is inert.
        assert!(table.get(i0, g0).is_none());
        assert!(!table.vacate(i0, g0));
        // The slot is reused under a new generation.
        let (i1, g1) = table.allocate(slot());
        assert_eq!(i0, i1);
        assert_ne!(g0, g1);
        assert!(table.get(i1, g1).is_some());
    }

    #[test]
    fn vacate_happens_at_most_once() {
        let mut table = CallTable::new();
        let (i, g) = table.allocate(slot());
        assert!(table.vacate(i, g));
        assert!(!table.vacate(i, g));
    }

    #[test]
    fn proxy_validates_names_up_front() {
        let (client, _server) = Connection::pair().unwrap();
        assert!(Proxy::new(&client, Some("org.test.Svc"), "/obj").is_ok());
        assert!(Proxy::new(&client, Some("bad bus name"), "/obj").is_err());
        assert!(Proxy::new(&client, None, "no-slash").is_err());
    }
}
