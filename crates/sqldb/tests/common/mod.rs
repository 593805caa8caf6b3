#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use sqldb::mock::MockDriver;
use sqldb::prelude::*;
use std::future::Future;

pub fn block_on<F, Fut>(f: F) -> Fut::Output
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

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got a value"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn mock_ctx(database: &str) -> (MockDriver, Ctx) {
    let driver = MockDriver::new();
    let conn = DbConn::from_url(Arc::new(driver.clone()), &format!("mock://localhost/{database}"))
        .expect("valid mock URL");
    (driver, Ctx::new().with_conn(Arc::new(conn)))
}
