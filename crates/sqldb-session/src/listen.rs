//! Context-level LISTEN/NOTIFY helpers.

use crate::context::Ctx;
use asupersync::{Cx, Outcome};
use sqldb_core::{Error, Result, Value, try_outcome};
use sqldb_notify::{OnNotify, OnUnlisten};

/// Subscribe to `channel` on the connection of `ctx`.
///
/// Fails inside a transaction and for drivers without LISTEN support.
pub fn listen_on_channel(
    ctx: &Ctx,
    channel: &str,
    on_notify: Option<OnNotify>,
    on_unlisten: Option<OnUnlisten>,
) -> Result<()> {
    ctx.conn().listen_on_channel(channel, on_notify, on_unlisten)
}

/// Drop every subscription to `channel`, running their unlisten callbacks.
pub fn unlisten_channel(ctx: &Ctx, channel: &str) -> Result<()> {
    ctx.conn().unlisten_channel(channel)
}

pub fn is_listening_on_channel(ctx: &Ctx, channel: &str) -> bool {
    ctx.conn().is_listening_on_channel(channel)
}

/// Send a notification with `payload` on `channel`.
///
/// Inside a transaction the notification is delivered on commit.
pub async fn notify(cx: &Cx, ctx: &Ctx, channel: &str, payload: &str) -> Outcome<(), Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let args = [Value::from(channel), Value::from(payload)];
    try_outcome!(ctx.conn().exec(cx, "SELECT pg_notify($1, $2)", &args).await);
    Outcome::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::DbConn;
    use crate::testing::{block_on, unwrap_outcome};
    use sqldb_core::{Config, ConnectionErrorKind};
    use sqldb_mock::MockDriver;
    use sqldb_notify::{ListenerRegistry, ListenerSettings};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn ctx_for(driver: &MockDriver, registry: &Arc<ListenerRegistry>) -> Ctx {
        let conn = DbConn::new(
            Arc::new(driver.clone()),
            Config::parse("mock://localhost/listen_tests").unwrap(),
        )
        .with_listener_registry(Arc::clone(registry));
        Ctx::new().with_conn(Arc::new(conn))
    }

    #[test]
    fn test_listen_and_receive() {
        let driver = MockDriver::new();
        let registry = Arc::new(ListenerRegistry::new(ListenerSettings::default()));
        let ctx = ctx_for(&driver, &registry);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_notify: OnNotify = Arc::new(move |channel: &str, payload: &str| {
            sink.lock().unwrap().push(format!("{channel}:{payload}"));
        });
        listen_on_channel(&ctx, "jobs", Some(on_notify), None).unwrap();
        assert!(is_listening_on_channel(&ctx, "jobs"));

        let listener = driver.listener().unwrap();
        assert!(listener.notify("jobs", "7"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "notification not delivered");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(seen.lock().unwrap()[0], "jobs:7");

        unlisten_channel(&ctx, "jobs").unwrap();
        assert!(!is_listening_on_channel(&ctx, "jobs"));
        registry.close_all();
    }

    #[test]
    fn test_listen_unsupported_driver() {
        let driver = MockDriver::without_listener();
        let registry = Arc::new(ListenerRegistry::new(ListenerSettings::default()));
        let ctx = ctx_for(&driver, &registry);
        match listen_on_channel(&ctx, "jobs", None, None) {
            Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Unsupported),
            other => panic!("expected unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_notify_sends_pg_notify() {
        let driver = MockDriver::new();
        let registry = Arc::new(ListenerRegistry::new(ListenerSettings::default()));
        let ctx = ctx_for(&driver, &registry);
        block_on(|cx| async move {
            unwrap_outcome(notify(&cx, &ctx, "jobs", "hello").await);
        });
        let call = driver.calls().pop().unwrap();
        assert_eq!(call.query, "SELECT pg_notify($1, $2)");
        assert_eq!(call.args, [Value::from("jobs"), Value::from("hello")]);
    }
}
