//! End-to-end dispatch over a direct connection pair: typed methods,
//! error replies, timeouts, properties, signals, re-registration and
//! introspection.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sorbus::{
    BusError, Connection, InterfaceHandle, Object, Proxy, Value, VTable, ERR_ACCESS_DENIED,
    ERR_INVALID_ARGS, ERR_PROPERTY_READ_ONLY, ERR_UNKNOWN_INTERFACE, ERR_UNKNOWN_METHOD,
    ERR_UNKNOWN_OBJECT, INTROSPECTABLE_INTERFACE, PEER_INTERFACE,
};

const CALC_IFACE: &str = "org.test.Calculator";
const CALC_PATH: &str = "/org/test/calculator";

struct Fixture {
    client: Connection,
    #[allow(dead_code)]
    server: Connection,
    object: Object,
    registration: Option<InterfaceHandle>,
    proxy: Proxy,
    counter: Arc<Mutex<u32>>,
    secret: Arc<Mutex<String>>,
}

fn calculator_vtable(counter: Arc<Mutex<u32>>, secret: Arc<Mutex<String>>) -> VTable {
    let counter_get = counter.clone();
    let counter_set = counter;
    let secret_set = secret;
    VTable::new()
        .method::<(i32, i32), (i32,), _>("Add", |(a, b)| Ok((a + b,)))
        .method::<(String, String), (String,), _>("Concat", |(a, b)| Ok((format!("{}{}", a, b),)))
        .method::<(i32,), (), _>("Fail", |_| {
            Err(BusError::new("org.test.Error.Broken", "requested failure"))
        })
        .method::<(String, u64), (String,), _>("SlowEcho", |(text, sleep_ms)| {
            thread::sleep(Duration::from_millis(sleep_ms));
            Ok((text,))
        })
        .method::<(), (), _>("Panic", |()| {
            panic!("handler blew up");
        })
        .signal::<(String,)>("Computed")
        .property::<String, _>("Version", || Ok("1.2.3".to_string()))
        .property_writable::<u32, _, _>(
            "Counter",
            move || Ok(*counter_get.lock().unwrap()),
            move |v| {
                *counter_set.lock().unwrap() = v;
                Ok(())
            },
        )
        .property_write_only::<String, _>("Secret", move |v| {
            *secret_set.lock().unwrap() = v;
            Ok(())
        })
}

fn fixture() -> Fixture {
    let (client, server) = Connection::pair().unwrap();
    let counter = Arc::new(Mutex::new(0u32));
    let secret = Arc::new(Mutex::new(String::new()));
    let object = Object::new(&server, CALC_PATH).unwrap();
    let registration = object
        .add_interface(
            CALC_IFACE,
            calculator_vtable(counter.clone(), secret.clone()),
        )
        .unwrap();
    server.enter_event_loop().unwrap();
    client.enter_event_loop().unwrap();
    let proxy = Proxy::new(&client, None, CALC_PATH).unwrap();
    Fixture {
        client,
        server,
        object,
        registration: Some(registration),
        proxy,
        counter,
        secret,
    }
}

#[test]
fn add_returns_the_sum() {
    let fx = fixture();
    let (sum,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (7i32, 8i32)).unwrap();
    assert_eq!(sum, 15);
    let (text,): (String,) = fx
        .proxy
        .call(CALC_IFACE, "Concat", ("foo".to_string(), "bar".to_string()))
        .unwrap();
    assert_eq!(text, "foobar");
}

#[test]
fn handler_error_arrives_with_its_symbolic_name() {
    let fx = fixture();
    let err = fx
        .proxy
        .call::<_, ()>(CALC_IFACE, "Fail", (1i32,))
        .unwrap_err();
    assert_eq!(err.name(), Some("org.test.Error.Broken"));
    assert!(err.to_string().contains("requested failure"));
}

#[test]
fn handler_panic_becomes_an_error_reply_and_the_loop_survives() {
    let fx = fixture();
    let err = fx.proxy.call::<_, ()>(CALC_IFACE, "Panic", ()).unwrap_err();
    assert!(err.name().is_some());
    // The server event loop must still dispatch afterwards.
    let (sum,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (2i32, 2i32)).unwrap();
    assert_eq!(sum, 4);
}

#[test]
fn unknown_targets_yield_distinct_errors() {
    let fx = fixture();
    let err = fx
        .proxy
        .call::<_, ()>(CALC_IFACE, "NoSuchMethod", ())
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_UNKNOWN_METHOD));

    let err = fx
        .proxy
        .call::<_, ()>("org.test.NotRegistered", "Add", ())
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_UNKNOWN_INTERFACE));

    let wrong_path = Proxy::new(&fx.client, None, "/org/test/nowhere").unwrap();
    let err = wrong_path
        .call::<_, ()>(CALC_IFACE, "Add", ())
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_UNKNOWN_OBJECT));
}

#[test]
fn mismatched_arguments_are_rejected() {
    let fx = fixture();
    let err = fx
        .proxy
        .call::<_, (i32,)>(CALC_IFACE, "Add", ("seven".to_string(), 8i32))
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_INVALID_ARGS));
}

#[test]
fn timeout_is_bounded_by_the_deadline_not_the_handler() {
    let fx = fixture();
    let started = Instant::now();
    let err = fx
        .proxy
        .call_with_timeout::<_, (String,)>(
            CALC_IFACE,
            "SlowEcho",
            ("late".to_string(), 600u64),
            Some(Duration::from_millis(120)),
        )
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(err.is_timeout(), "unexpected error: {:?}", err);
    assert!(
        elapsed < Duration::from_millis(450),
        "timeout took {:?}, expected roughly the 120ms deadline",
        elapsed
    );

    // A later call on the same proxy still works once the handler wakes.
    let (sum,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (1i32, 1i32)).unwrap();
    assert_eq!(sum, 2);
}

#[test]
fn oneway_calls_do_not_wait() {
    let fx = fixture();
    fx.proxy
        .call_noreply(CALC_IFACE, "SlowEcho", ("dropped".to_string(), 200u64))
        .unwrap();
    // The fire-and-forget call returns immediately; a normal call after
    // it still gets its own reply.
    let (sum,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (3i32, 4i32)).unwrap();
    assert_eq!(sum, 7);
}

#[test]
fn properties_get_set_and_get_all() {
    let fx = fixture();
    assert_eq!(
        fx.proxy.get_property(CALC_IFACE, "Counter").unwrap(),
        Value::UInt32(0)
    );
    fx.proxy
        .set_property(CALC_IFACE, "Counter", 42u32)
        .unwrap();
    assert_eq!(*fx.counter.lock().unwrap(), 42);
    assert_eq!(
        fx.proxy.get_property(CALC_IFACE, "Counter").unwrap(),
        Value::UInt32(42)
    );

    let all = fx.proxy.get_all_properties(CALC_IFACE).unwrap();
    assert_eq!(all.get("Counter"), Some(&Value::UInt32(42)));
    assert_eq!(all.get("Version"), Some(&Value::Str("1.2.3".to_string())));
    // Write-only properties are omitted from GetAll.
    assert!(!all.contains_key("Secret"));
}

#[test]
fn read_only_and_write_only_properties_reject_asymmetrically() {
    let fx = fixture();
    let err = fx
        .proxy
        .set_property(CALC_IFACE, "Version", "2.0.0")
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_PROPERTY_READ_ONLY));

    let err = fx.proxy.get_property(CALC_IFACE, "Secret").unwrap_err();
    assert_eq!(err.name(), Some(ERR_ACCESS_DENIED));
    assert!(err.to_string().contains("write-only"));

    fx.proxy
        .set_property(CALC_IFACE, "Secret", "hunter2")
        .unwrap();
    assert_eq!(*fx.secret.lock().unwrap(), "hunter2");
}

#[test]
fn property_type_mismatch_is_invalid_args() {
    let fx = fixture();
    let err = fx
        .proxy
        .set_property(CALC_IFACE, "Counter", "not a number")
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_INVALID_ARGS));
}

#[test]
fn signals_reach_subscribers_with_their_payload() {
    let fx = fixture();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let _guard = fx
        .proxy
        .match_signal(CALC_IFACE, "Computed", move |msg| {
            let mut msg = msg_clone_for_read(msg);
            if let Ok((text,)) = <(String,) as sorbus::ArgList>::read_args(&mut msg) {
                seen2.lock().unwrap().push(text);
            }
        })
        .unwrap();

    fx.object
        .emit_signal(CALC_IFACE, "Computed", ("7+8=15".to_string(),))
        .unwrap();

    assert!(wait_until(|| seen.lock().unwrap().len() == 1));
    assert_eq!(seen.lock().unwrap()[0], "7+8=15");
}

#[test]
fn emitting_an_undeclared_or_mistyped_signal_fails_locally() {
    let fx = fixture();
    assert!(fx
        .object
        .emit_signal(CALC_IFACE, "NotDeclared", ("x".to_string(),))
        .is_err());
    assert!(fx
        .object
        .emit_signal(CALC_IFACE, "Computed", (1u32,))
        .is_err());
}

#[test]
fn properties_changed_signal_carries_values() {
    type Changed = (String, std::collections::HashMap<String, Value>, Vec<String>);

    let fx = fixture();
    let seen: Arc<Mutex<Vec<Changed>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let _guard = fx
        .proxy
        .match_signal(sorbus::PROPERTIES_INTERFACE, "PropertiesChanged", move |msg| {
            let mut msg = msg_clone_for_read(msg);
            if let Ok(args) = <Changed as sorbus::ArgList>::read_args(&mut msg) {
                seen2.lock().unwrap().push(args);
            }
        })
        .unwrap();

    fx.object
        .emit_properties_changed(CALC_IFACE, &["Counter"])
        .unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 1));
    let seen = seen.lock().unwrap();
    let (interface, changed, invalidated) = &seen[0];
    assert_eq!(interface, CALC_IFACE);
    assert_eq!(changed.get("Counter"), Some(&Value::UInt32(0)));
    assert!(invalidated.is_empty());
}

#[test]
fn releasing_a_registration_stops_dispatch_for_that_interface_only() {
    let mut fx = fixture();
    // A second interface at the same path keeps working afterwards.
    let aux = VTable::new().method::<(), (i32,), _>("Forty", |()| Ok((40,)));
    let _aux_handle = fx.object.add_interface("org.test.Aux", aux).unwrap();

    let (sum,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (1i32, 2i32)).unwrap();
    assert_eq!(sum, 3);

    fx.registration.take().unwrap().release();

    let err = fx
        .proxy
        .call::<_, (i32,)>(CALC_IFACE, "Add", (1i32, 2i32))
        .unwrap_err();
    assert_eq!(err.name(), Some(ERR_UNKNOWN_INTERFACE));
    // Signals for the released interface can no longer be emitted.
    assert!(fx
        .object
        .emit_signal(CALC_IFACE, "Computed", ("gone".to_string(),))
        .is_err());

    let (forty,): (i32,) = fx.proxy.call("org.test.Aux", "Forty", ()).unwrap();
    assert_eq!(forty, 40);
}

#[test]
fn re_registration_replaces_the_table_as_a_whole() {
    let fx = fixture();
    let replacement = VTable::new().method::<(i32, i32), (i32,), _>("Add", |(a, b)| Ok((a * b,)));
    let v2 = fx.object.add_interface(CALC_IFACE, replacement).unwrap();

    let (product,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (6i32, 7i32)).unwrap();
    assert_eq!(product, 42);

    // Dropping the superseded handle must not tear down the new table.
    drop(fx.registration);
    let (product,): (i32,) = fx.proxy.call(CALC_IFACE, "Add", (6i32, 7i32)).unwrap();
    assert_eq!(product, 42);
    drop(v2);
}

#[test]
fn introspection_describes_the_object() {
    let fx = fixture();
    // A child object shows up as a node stub.
    let sub = Object::new(&fx.server, "/org/test/calculator/history").unwrap();
    let _sub_handle = sub
        .add_interface(
            "org.test.History",
            VTable::new().method::<(), (), _>("Clear", |()| Ok(())),
        )
        .unwrap();

    let (xml,): (String,) = fx
        .proxy
        .call(INTROSPECTABLE_INTERFACE, "Introspect", ())
        .unwrap();
    assert!(xml.contains("<interface name=\"org.test.Calculator\">"));
    assert!(xml.contains("<method name=\"Add\">"));
    assert!(xml.contains("<signal name=\"Computed\">"));
    assert!(xml.contains("property name=\"Counter\" type=\"u\" access=\"readwrite\""));
    assert!(xml.contains("property name=\"Version\" type=\"s\" access=\"read\""));
    assert!(xml.contains("property name=\"Secret\" type=\"s\" access=\"write\""));
    assert!(xml.contains("<node name=\"history\"/>"));
    assert!(xml.contains("org.freedesktop.DBus.Introspectable"));
}

#[test]
fn peer_ping_answers() {
    let fx = fixture();
    fx.proxy.call::<(), ()>(PEER_INTERFACE, "Ping", ()).unwrap();
    let (id,): (String,) = fx.proxy.call(PEER_INTERFACE, "GetMachineId", ()).unwrap();
    assert!(!id.is_empty());
}

// Signal handlers receive a shared `&Message`; decode from a clone,
// whose cursor starts at the beginning of the body.
fn msg_clone_for_read(msg: &sorbus::Message) -> sorbus::Message {
    msg.clone()
}

fn wait_until(pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
