//! Shared helpers for unit tests.

use crate::conn::DbConn;
use crate::context::Ctx;
use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use sqldb_core::{Config, Error};
use sqldb_mock::MockDriver;
use std::future::Future;
use std::sync::Arc;

/// Run `f` to completion on a fresh runtime. The context is leaked so that
/// nested bodies can copy the reference.
pub(crate) fn block_on<F, Fut>(f: F) -> Fut::Output
where
    F: FnOnce(&'static Cx) -> Fut,
    Fut: Future,
{
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx: &'static Cx = Box::leak(Box::new(Cx::for_testing()));
    rt.block_on(f(cx))
}

pub(crate) fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// A mock driver and a context whose connection wraps it.
pub(crate) fn mock_ctx() -> (MockDriver, Ctx) {
    let driver = MockDriver::new();
    let conn = DbConn::new(
        Arc::new(driver.clone()),
        Config::parse("mock://localhost/session_tests").expect("valid test URL"),
    );
    (driver, Ctx::new().with_conn(Arc::new(conn)))
}
