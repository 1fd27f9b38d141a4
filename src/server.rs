//! A ready-made accept loop for serving direct connections.
//!
//! [`serve`] binds a listener, accepts peers and gives each one its own
//! [`Connection`] with a running event loop. It is a convenience over
//! [`Listener`](crate::Listener) + [`Connection::open_server_stream`];
//! servers with their own accept strategy can use those directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::transport::Listener;

/// Configuration for [`serve`].
///
/// ```
/// let config = sorbus::ServeConfig::default();
/// assert_eq!(config.max_connections, 100);
/// assert_eq!(config.idle_timeout, None);
/// assert!(config.stop.is_none());
/// ```
pub struct ServeConfig {
    /// Upper bound on concurrently served connections; peers beyond it
    /// are turned away at accept.
    pub max_connections: usize,
    /// Return with [`Error::Timeout`] after this long with no connected
    /// peer and no new connection. `None` listens forever.
    pub idle_timeout: Option<Duration>,
    /// Cooperative stop flag, checked between accepts; setting it to
    /// `true` makes [`serve`] return cleanly.
    pub stop: Option<Arc<AtomicBool>>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            max_connections: 100,
            idle_timeout: None,
            stop: None,
        }
    }
}

/// Accept direct connections at `address` and serve each until it closes.
///
/// `setup` runs once per accepted peer, before that peer's event loop
/// starts; register objects there. Closed connections are reaped between
/// accepts, releasing their registrations and event-loop threads.
pub fn serve<F>(address: &str, config: &ServeConfig, setup: F) -> Result<()>
where
    F: Fn(&Connection) -> Result<()>,
{
    let listener = Listener::bind(address)?;
    debug!(address, "serving direct connections");
    let mut active: Vec<Connection> = Vec::new();
    let mut idle_since = Instant::now();
    loop {
        if let Some(stop) = &config.stop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        active.retain(Connection::is_open);
        if active.is_empty() {
            if let Some(limit) = config.idle_timeout {
                if idle_since.elapsed() >= limit {
                    return Err(Error::Timeout);
                }
            }
        } else {
            idle_since = Instant::now();
        }

        // Short accept slices keep the stop flag and idle clock live.
        match listener.accept(100) {
            Ok(stream) => {
                if active.len() >= config.max_connections {
                    warn!("connection limit reached; turning a peer away");
                    continue;
                }
                let conn = Connection::open_server_stream(stream)?;
                setup(&conn)?;
                conn.enter_event_loop()?;
                active.push(conn);
                idle_since = Instant::now();
            }
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
}
