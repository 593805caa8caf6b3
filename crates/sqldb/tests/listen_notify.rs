//! LISTEN/NOTIFY through a context-carried connection.

mod common;

use common::{block_on, expect_err, unwrap_outcome};
use sqldb::mock::MockDriver;
use sqldb::prelude::*;
use sqldb::{
    ListenerRegistry, ListenerSettings, OnNotify, OnUnlisten, is_listening_on_channel,
    listen_on_channel, notify, unlisten_channel,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn fast_settings() -> ListenerSettings {
    ListenerSettings {
        min_reconnect_interval: Duration::from_millis(5),
        max_reconnect_interval: Duration::from_millis(20),
        keepalive_interval: Duration::from_secs(60),
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn listening_ctx(database: &str) -> (MockDriver, Arc<ListenerRegistry>, Ctx) {
    let driver = MockDriver::new();
    let registry = Arc::new(ListenerRegistry::new(fast_settings()));
    let conn = DbConn::from_url(Arc::new(driver.clone()), &format!("mock://localhost/{database}"))
        .expect("valid mock URL")
        .with_listener_registry(Arc::clone(&registry));
    (driver, registry, Ctx::new().with_conn(Arc::new(conn)))
}

fn collector() -> (OnNotify, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: OnNotify = Arc::new(move |_: &str, payload: &str| {
        sink.lock().unwrap().push(payload.to_string());
    });
    (callback, seen)
}

#[test]
fn repeated_listens_append_and_unlisten_removes_all() {
    let (driver, registry, ctx) = listening_ctx("repeated_listens");
    let (callback, seen) = collector();
    let unlistened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unlistened);
    let on_unlisten: OnUnlisten = Arc::new(move |_: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    listen_on_channel(&ctx, "orders", Some(Arc::clone(&callback)), Some(Arc::clone(&on_unlisten))).unwrap();
    listen_on_channel(&ctx, "orders", Some(callback), Some(on_unlisten)).unwrap();

    let listener = driver.listener().expect("mock listener");
    assert!(listener.notify("orders", "created"));
    wait_until("both callbacks", || seen.lock().unwrap().len() == 2);

    unlisten_channel(&ctx, "orders").unwrap();
    assert_eq!(unlistened.load(Ordering::SeqCst), 2);
    assert!(!is_listening_on_channel(&ctx, "orders"));
    assert!(!listener.notify("orders", "late"));
    registry.close_all();
}

#[test]
fn listener_reconnects_and_relistens() {
    let (driver, registry, ctx) = listening_ctx("listener_reconnects");
    let (callback, seen) = collector();
    listen_on_channel(&ctx, "events", Some(callback), None).unwrap();

    let listener = driver.listener().expect("mock listener");
    assert!(listener.disconnect());
    wait_until("reconnect", || listener.connect_count() == 2);
    wait_until("re-issued LISTEN", || listener.listening_channels() == ["events"]);

    assert!(listener.notify("events", "after"));
    wait_until("notification after reconnect", || seen.lock().unwrap().len() == 1);
    assert_eq!(seen.lock().unwrap()[0], "after");
    registry.close_all();
}

#[test]
fn listening_is_refused_inside_a_transaction() {
    let (_driver, registry, ctx) = listening_ctx("listen_in_transaction");
    block_on(|cx| async move {
        let err = expect_err(
            transaction(&cx, &ctx, |tx| async move {
                try_outcome!(listen_on_channel(&tx, "events", None, None));
                Outcome::Ok(())
            })
            .await,
        );
        assert!(err.is_within_transaction());
    });
    assert!(registry.is_empty());
}

#[test]
fn notify_goes_through_pg_notify() {
    let (driver, _registry, ctx) = listening_ctx("notify_pg_notify");
    block_on(|cx| async move {
        unwrap_outcome(
            transaction(&cx, &ctx, |tx| async move { notify(&cx, &tx, "events", "{\"id\":1}").await }).await,
        );
    });
    assert_eq!(
        driver.queries(),
        ["BEGIN", "SELECT pg_notify($1, $2)", "COMMIT"]
    );
}

#[test]
fn closing_the_connection_closes_its_listener() {
    let (driver, registry, ctx) = listening_ctx("closing_connection");
    listen_on_channel(&ctx, "events", None, None).unwrap();
    assert_eq!(registry.len(), 1);

    block_on(|cx| async move {
        unwrap_outcome(ctx.conn().close(&cx).await);
    });

    assert!(registry.is_empty());
    assert!(driver.is_closed());
    let current = driver.listener().and_then(|l| l.current()).expect("listener connection");
    wait_until("listener connection closed", || current.is_closed());
}

#[test]
fn shared_listener_outlives_one_closed_connection() {
    let registry = Arc::new(ListenerRegistry::new(fast_settings()));
    let connect = |driver: &MockDriver| {
        let conn = DbConn::from_url(Arc::new(driver.clone()), "mock://localhost/shared_listener")
            .expect("valid mock URL")
            .with_listener_registry(Arc::clone(&registry));
        Ctx::new().with_conn(Arc::new(conn))
    };
    let (first_driver, second_driver) = (MockDriver::new(), MockDriver::new());
    let (first, second) = (connect(&first_driver), connect(&second_driver));
    let (callback, seen) = collector();

    listen_on_channel(&first, "events", None, None).unwrap();
    listen_on_channel(&second, "events", Some(callback), None).unwrap();
    assert_eq!(registry.len(), 1);

    let closing = first.clone();
    block_on(|cx| async move {
        unwrap_outcome(closing.conn().close(&cx).await);
    });
    assert!(first_driver.is_closed());
    assert!(is_listening_on_channel(&second, "events"));

    let listener = first_driver.listener().expect("mock listener");
    assert!(listener.notify("events", "kept"));
    wait_until("notification after the other connection closed", || seen.lock().unwrap().len() == 1);

    let closing = second.clone();
    block_on(|cx| async move {
        unwrap_outcome(closing.conn().close(&cx).await);
    });
    assert!(registry.is_empty());
}
