//! Direct connections over a listening Unix socket: bind, accept, serve,
//! call, with no bus daemon anywhere.

use std::thread;
use std::time::Duration;

use sorbus::{Connection, Error, Listener, Object, Proxy, VTable};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn accept_times_out_when_nobody_connects() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:path={}/quiet.sock", dir.path().display());
    let listener = Listener::bind(&address).unwrap();
    match listener.accept(50) {
        Err(Error::Timeout) => {}
        other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn listener_accepts_a_direct_peer_and_serves_calls() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:path={}/bus.sock", dir.path().display());
    let listener = Listener::bind(&address).unwrap();

    let server_thread = thread::spawn(
        move || -> sorbus::Result<(Connection, sorbus::InterfaceHandle)> {
            let stream = listener.accept(2_000)?;
            let conn = Connection::open_server_stream(stream)?;
            let object = Object::new(&conn, "/org/test/echo")?;
            let vtable =
                VTable::new().method::<(String,), (String,), _>("Echo", |(s,)| Ok((s,)));
            let registration = object.add_interface("org.test.Echo", vtable)?;
            conn.enter_event_loop()?;
            Ok((conn, registration))
        },
    );

    // Give the listener a moment, then connect and call.
    let mut client = None;
    for _ in 0..50 {
        match Connection::open_direct(&address) {
            Ok(conn) => {
                client = Some(conn);
                break;
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    let client = client.expect("could not connect to the listener");
    let (server, _registration) = server_thread.join().unwrap().unwrap();

    client.enter_event_loop().unwrap();
    let proxy = Proxy::new(&client, None, "/org/test/echo").unwrap();
    let (echoed,): (String,) = proxy
        .call("org.test.Echo", "Echo", ("ping".to_string(),))
        .unwrap();
    assert_eq!(echoed, "ping");

    client.leave_event_loop().unwrap();
    server.leave_event_loop().unwrap();
}

#[test]
fn serve_accepts_clients_and_returns_on_idle_timeout() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:path={}/served.sock", dir.path().display());

    let server_thread = {
        let address = address.clone();
        thread::spawn(move || {
            sorbus::serve(
                &address,
                &sorbus::ServeConfig {
                    idle_timeout: Some(Duration::from_millis(500)),
                    ..Default::default()
                },
                |conn| {
                    let object = Object::new(conn, "/org/test/echo")?;
                    let vtable = VTable::new()
                        .method::<(String,), (String,), _>("Echo", |(s,)| Ok((s,)));
                    // The registration outlives this closure; float it.
                    object.add_interface("org.test.Echo", vtable)?.detach();
                    Ok(())
                },
            )
        })
    };

    let mut client = None;
    for _ in 0..100 {
        match Connection::open_direct(&address) {
            Ok(conn) => {
                client = Some(conn);
                break;
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    let client = client.expect("could not connect to the served address");
    client.enter_event_loop().unwrap();
    let proxy = Proxy::new(&client, None, "/org/test/echo").unwrap();
    let (echoed,): (String,) = proxy
        .call("org.test.Echo", "Echo", ("served".to_string(),))
        .unwrap();
    assert_eq!(echoed, "served");

    // Disconnect; the server reaps us and then times out idle.
    client.leave_event_loop().unwrap();
    drop(client);
    match server_thread.join().unwrap() {
        Err(Error::Timeout) => {}
        other => panic!("expected the idle timeout, got {:?}", other),
    }
}

#[test]
fn serve_stops_on_the_flag() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix:path={}/stoppable.sock", dir.path().display());
    let stop = Arc::new(AtomicBool::new(false));

    let server_thread = {
        let address = address.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            sorbus::serve(
                &address,
                &sorbus::ServeConfig {
                    stop: Some(stop),
                    ..Default::default()
                },
                |_conn| Ok(()),
            )
        })
    };

    thread::sleep(Duration::from_millis(150));
    stop.store(true, Ordering::SeqCst);
    assert!(server_thread.join().unwrap().is_ok());
}

#[test]
fn direct_open_to_a_missing_socket_fails() {
    let err = Connection::open_direct("unix:path=/nonexistent/definitely/missing.sock");
    assert!(err.is_err());
    let err = Connection::open_direct("launchd:env=FOO").unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
}
