//! Client and server runtime for the D-Bus wire protocol.
//!
//! `sorbus` lets a process expose objects with methods, properties and
//! signals, and lets other processes discover and invoke them over a
//! shared bus connection, or directly, peer to peer, with no daemon in
//! between. The crate covers the marshalling-and-dispatch core: the
//! type-signature resolver, the container-walking codec, the asynchronous
//! call engine on the calling side and the vtable dispatch engine on the
//! serving side, all built around a single poll-based event loop per
//! connection.
//!
//! # Serving an object
//!
//! ```no_run
//! use sorbus::{BusError, Connection, Object, VTable};
//!
//! fn main() -> sorbus::Result<()> {
//!     let conn = Connection::open()?;
//!     conn.request_name("org.example.Calculator")?;
//!
//!     let object = Object::new(&conn, "/org/example/calculator")?;
//!     let vtable = VTable::new()
//!         .method::<(i32, i32), (i32,), _>("Add", |(a, b)| Ok((a + b,)))
//!         .method::<(i32, i32), (i32,), _>("Divide", |(a, b)| {
//!             if b == 0 {
//!                 Err(BusError::new("org.example.Error.DivisionByZero", "b is zero"))
//!             } else {
//!                 Ok((a / b,))
//!             }
//!         })
//!         .signal::<(String,)>("Computed");
//!     let _registration = object.add_interface("org.example.Calculator", vtable)?;
//!
//!     conn.enter_event_loop()?;
//!     // ... the loop dispatches until we leave it.
//!     conn.leave_event_loop()?;
//!     Ok(())
//! }
//! ```
//!
//! # Calling it
//!
//! ```no_run
//! use sorbus::{Connection, Proxy};
//!
//! fn main() -> sorbus::Result<()> {
//!     let conn = Connection::open()?;
//!     conn.enter_event_loop()?;
//!
//!     let proxy = Proxy::new(&conn, Some("org.example.Calculator"), "/org/example/calculator")?;
//!
//!     // Blocking style.
//!     let (sum,): (i32,) = proxy.call("org.example.Calculator", "Add", (7i32, 8i32))?;
//!     assert_eq!(sum, 15);
//!
//!     // Callback style.
//!     let pending = proxy.call_async_cb(
//!         "org.example.Calculator",
//!         "Add",
//!         (1i32, 2i32),
//!         None,
//!         |reply| match reply {
//!             Ok(_) => println!("done"),
//!             Err(e) => eprintln!("failed: {}", e),
//!         },
//!     )?;
//!     assert!(pending.is_pending());
//!     Ok(())
//! }
//! ```
//!
//! With the `tokio` feature (on by default), `Proxy::call_async` offers a
//! third, task-suspending call style:
//!
//! ```no_run
//! # #[cfg(feature = "tokio")]
//! # async fn call(proxy: &sorbus::Proxy) -> sorbus::Result<()> {
//! let (sum,): (i32,) = proxy
//!     .call_async("org.example.Calculator", "Add", (7i32, 8i32))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Direct connections (`Connection::open_direct*`, `Connection::pair`,
//! [`Listener`]) speak the same protocol without a bus daemon; name
//! registration and match forwarding are the only bus-specific parts.

mod codec;
mod connection;
mod error;
mod message;
pub mod names;
mod object;
mod proxy;
mod server;
mod signature;
mod stream;
mod transport;
mod value;

pub use crate::codec::{
    decode_body_values, decode_value, encode_value, encode_value_as, from_value, to_value, Arg,
    ArgList,
};
pub use crate::connection::{
    Connection, MatchGuard, MatchSpec, BUS_INTERFACE, BUS_NAME, BUS_PATH, DEFAULT_CALL_TIMEOUT,
};
pub use crate::error::{
    BusError, Error, Result, ERR_ACCESS_DENIED, ERR_DISCONNECTED, ERR_FAILED, ERR_INVALID_ARGS,
    ERR_NOT_SUPPORTED, ERR_NO_REPLY, ERR_PROPERTY_READ_ONLY, ERR_UNKNOWN_INTERFACE,
    ERR_UNKNOWN_METHOD, ERR_UNKNOWN_OBJECT, ERR_UNKNOWN_PROPERTY,
};
pub use crate::message::{Message, MessageFlags, MessageKind};
pub use crate::object::{
    InterfaceFlags, InterfaceHandle, MethodFlags, Object, PropertyFlags, SignalFlags, VTable,
    INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE,
};
pub use crate::proxy::{PendingAsyncCall, Proxy};
pub use crate::server::{serve, ServeConfig};
pub use crate::signature::{Basic, Signature, TypeTag};
pub use crate::stream::Stream;
pub use crate::transport::{BusAddress, Listener};
pub use crate::value::{Array, Dict, ObjectPath, UnixFd, Value};
