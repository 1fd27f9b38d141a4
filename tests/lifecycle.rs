//! Pending-call lifecycle: the is-pending window, cancellation races,
//! proxy teardown, and the task-style call built on the same machinery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sorbus::{BusError, Connection, Object, Proxy, VTable};

const IFACE: &str = "org.test.Lifecycle";
const PATH: &str = "/org/test/lifecycle";

struct Served {
    #[allow(dead_code)]
    client: Connection,
    #[allow(dead_code)]
    server: Connection,
    #[allow(dead_code)]
    registration: sorbus::InterfaceHandle,
}

fn serve() -> (Served, Proxy) {
    let (client, server) = Connection::pair().unwrap();
    let object = Object::new(&server, PATH).unwrap();
    let vtable = VTable::new()
        .method::<(i32, i32), (i32,), _>("Add", |(a, b)| Ok((a + b,)))
        .method::<(i32,), (), _>("Fail", |_| {
            Err(BusError::new("org.test.Error.Nope", "as requested"))
        })
        .method::<(u64,), (u64,), _>("Sleep", |(ms,)| {
            thread::sleep(Duration::from_millis(ms));
            Ok((ms,))
        });
    let registration = object.add_interface(IFACE, vtable).unwrap();
    server.enter_event_loop().unwrap();
    client.enter_event_loop().unwrap();
    let proxy = Proxy::new(&client, None, PATH).unwrap();
    (
        Served {
            client,
            server,
            registration,
        },
        proxy,
    )
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

#[test]
fn observer_is_pending_until_the_callback_has_returned() {
    let (_env, proxy) = serve();
    let finished = Arc::new(AtomicUsize::new(0));
    let finished2 = finished.clone();
    let pending = proxy
        .call_async_cb(IFACE, "Sleep", (150u64,), None, move |reply| {
            assert!(reply.is_ok());
            // Still "pending" from the observer's point of view while we
            // linger in the callback.
            thread::sleep(Duration::from_millis(50));
            finished2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(pending.is_pending());
    assert!(wait_until(|| finished.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| !pending.is_pending()));
}

#[test]
fn callback_gets_the_reply_value() {
    let (_env, proxy) = serve();
    let result: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    let result2 = result.clone();
    let _pending = proxy
        .call_async_cb(IFACE, "Add", (20i32, 22i32), None, move |reply| {
            let mut reply = reply.unwrap();
            let (sum,) = <(i32,) as sorbus::ArgList>::read_args(&mut reply).unwrap();
            *result2.lock().unwrap() = Some(sum);
        })
        .unwrap();
    assert!(wait_until(|| result.lock().unwrap().is_some()));
    assert_eq!(*result.lock().unwrap(), Some(42));
}

#[test]
fn callback_gets_remote_errors_as_err() {
    let (_env, proxy) = serve();
    let name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let name2 = name.clone();
    let _pending = proxy
        .call_async_cb(IFACE, "Fail", (1i32,), None, move |reply| {
            let err = reply.unwrap_err();
            *name2.lock().unwrap() = err.name().map(str::to_string);
        })
        .unwrap();
    assert!(wait_until(|| name.lock().unwrap().is_some()));
    assert_eq!(name.lock().unwrap().as_deref(), Some("org.test.Error.Nope"));
}

#[test]
fn cancel_prevents_the_callback() {
    let (_env, proxy) = serve();
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked2 = invoked.clone();
    let pending = proxy
        .call_async_cb(IFACE, "Sleep", (200u64,), None, move |_| {
            invoked2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(pending.is_pending());
    pending.cancel();
    assert!(!pending.is_pending());

    // The reply arrives at the connection later and finds nobody to tell.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_is_idempotent_and_safe_after_completion() {
    let (_env, proxy) = serve();
    let pending = proxy
        .call_async_cb(IFACE, "Add", (1i32, 1i32), None, |_| {})
        .unwrap();
    assert!(wait_until(|| !pending.is_pending()));
    // Cancel after natural completion: a no-op, twice over.
    pending.cancel();
    pending.cancel();

    let pending = proxy
        .call_async_cb(IFACE, "Sleep", (150u64,), None, |_| {})
        .unwrap();
    pending.cancel();
    pending.cancel();
    assert!(!pending.is_pending());
}

#[test]
fn timeout_flows_through_the_callback_as_a_timeout_error() {
    let (_env, proxy) = serve();
    let outcome: Arc<Mutex<Option<sorbus::Error>>> = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();
    let started = Instant::now();
    let _pending = proxy
        .call_async_cb(
            IFACE,
            "Sleep",
            (600u64,),
            Some(Duration::from_millis(100)),
            move |reply| {
                *outcome2.lock().unwrap() = reply.err();
            },
        )
        .unwrap();
    assert!(wait_until(|| outcome.lock().unwrap().is_some()));
    assert!(started.elapsed() < Duration::from_millis(450));
    assert!(outcome.lock().unwrap().as_ref().unwrap().is_timeout());
}

#[test]
fn dropping_the_proxy_finalizes_in_flight_calls_without_callbacks() {
    let (_env, proxy) = serve();
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked2 = invoked.clone();
    let pending = proxy
        .call_async_cb(IFACE, "Sleep", (200u64,), None, move |_| {
            invoked2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    drop(proxy);
    assert!(!pending.is_pending());
    pending.cancel(); // inert on a dead proxy

    thread::sleep(Duration::from_millis(400));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn observers_survive_slot_recycling() {
    let (_env, proxy) = serve();
    let first = proxy
        .call_async_cb(IFACE, "Add", (1i32, 2i32), None, |_| {})
        .unwrap();
    assert!(wait_until(|| !first.is_pending()));

    // The next call reuses the vacated slot under a new generation; the
    // stale observer must stay inert rather than touch the new call.
    let second = proxy
        .call_async_cb(IFACE, "Sleep", (150u64,), None, |_| {})
        .unwrap();
    first.cancel();
    assert!(!first.is_pending());
    assert!(second.is_pending());
    assert!(wait_until(|| !second.is_pending()));
}

#[cfg(feature = "tokio")]
mod task_style {
    use super::*;

    #[tokio::test]
    async fn task_call_returns_the_value() {
        let (_env, proxy) = serve();
        let (sum,): (i32,) = proxy.call_async(IFACE, "Add", (7i32, 8i32)).await.unwrap();
        assert_eq!(sum, 15);
    }

    #[tokio::test]
    async fn task_call_propagates_remote_errors() {
        let (_env, proxy) = serve();
        let err = proxy
            .call_async::<_, ()>(IFACE, "Fail", (1i32,))
            .await
            .unwrap_err();
        assert_eq!(err.name(), Some("org.test.Error.Nope"));
    }

    #[tokio::test]
    async fn task_call_times_out_like_the_other_styles() {
        let (_env, proxy) = serve();
        let proxy = proxy.with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = proxy
            .call_async::<_, (u64,)>(IFACE, "Sleep", (600u64,))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(450));
    }
}
