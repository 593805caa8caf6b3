//! Transaction helpers.
//!
//! All helpers take the body as a closure receiving a [`Ctx`] bound to the
//! transaction connection. The body's outcome decides the ending:
//!
//! - `Ok` commits;
//! - `Err`, `Cancelled` and `Panicked` roll back and are returned as-is;
//! - a panic unwinding out of the body rolls back, is logged and then
//!   resumed.
//!
//! Nesting is pass-through: a transaction helper called inside a
//! transaction runs its body on the enclosing transaction without
//! `BEGIN`/`COMMIT`, after checking that the requested options are
//! compatible with the enclosing ones. [`transaction_savepoint`] and
//! [`isolated_transaction`] are the exceptions.

use crate::conn::Connection;
use crate::context::Ctx;
use asupersync::{Cx, Outcome};
use sqldb_core::{Error, IsolationLevel, TransactionError, TransactionErrorKind, TxOptions, try_outcome};
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

/// Default number of attempts for [`serialized_transaction`].
pub const DEFAULT_SERIALIZED_TRANSACTION_RETRIES: usize = 10;

static SERIALIZED_RETRIES: AtomicUsize = AtomicUsize::new(DEFAULT_SERIALIZED_TRANSACTION_RETRIES);
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
static NEXT_SAVEPOINT: AtomicU64 = AtomicU64::new(1);

/// Set how many times [`serialized_transaction`] runs its body before
/// giving up. Values below 1 are treated as 1.
pub fn set_serialized_transaction_retries(retries: usize) {
    SERIALIZED_RETRIES.store(retries.max(1), Ordering::SeqCst);
}

pub fn serialized_transaction_retries() -> usize {
    SERIALIZED_RETRIES.load(Ordering::SeqCst)
}

/// Next process-wide transaction serial number.
pub fn next_transaction_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::SeqCst)
}

/// Whether `ctx` is inside a transaction.
///
/// Always `false` for contexts marked with [`Ctx::without_transactions`].
pub fn is_transaction(ctx: &Ctx) -> bool {
    !ctx.is_without_transactions() && ctx.conn().is_transaction()
}

/// Check that `requested` may run inside a transaction opened with
/// `enclosing`.
///
/// A nested request must not ask for a stricter isolation level, and must
/// not ask for writes inside a read-only transaction.
pub fn check_tx_options_compatibility(
    enclosing: Option<TxOptions>,
    requested: Option<TxOptions>,
) -> Result<(), Error> {
    let Some(requested) = requested else {
        return Ok(());
    };
    let enclosing = enclosing.unwrap_or_default();
    if enclosing.read_only && !requested.read_only {
        return Err(Error::transaction(
            TransactionErrorKind::IncompatibleOptions,
            "cannot start a read-write transaction inside a read-only transaction",
        ));
    }
    if requested.isolation.strictness() > enclosing.isolation.strictness() {
        return Err(Error::transaction(
            TransactionErrorKind::IncompatibleOptions,
            format!(
                "cannot raise isolation from {} to {} in a nested transaction",
                isolation_name(enclosing.isolation),
                isolation_name(requested.isolation)
            ),
        ));
    }
    Ok(())
}

fn isolation_name(level: IsolationLevel) -> &'static str {
    level.as_sql().unwrap_or("DEFAULT")
}

// ============================================================================
// Panic capture
// ============================================================================

/// Polls a future, turning a panic into an `Err` with its payload.
struct CatchUnwind<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(panic) => Poll::Ready(Err(panic)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

// ============================================================================
// Core
// ============================================================================

async fn rollback_quietly(cx: &Cx, tx: &Arc<dyn Connection>, serial: u64) {
    match tx.rollback(cx).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => tracing::warn!(serial, error = %e, "Rollback failed"),
        Outcome::Cancelled(reason) => tracing::warn!(serial, ?reason, "Rollback cancelled"),
        Outcome::Panicked(payload) => tracing::error!(serial, ?payload, "Rollback panicked"),
    }
}

/// Begin a transaction on `parent`, run `f` on it and commit or roll back.
async fn run_transaction<T, F, Fut>(
    cx: &Cx,
    ctx: &Ctx,
    parent: &Arc<dyn Connection>,
    opts: Option<TxOptions>,
    f: F,
) -> Outcome<T, Error>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let serial = next_transaction_serial();
    let tx = try_outcome!(parent.begin(cx, serial, opts).await);
    tracing::info!(serial, ?opts, "Beginning transaction");

    let body = CatchUnwind {
        inner: Box::pin(f(ctx.with_conn(Arc::clone(&tx)))),
    };
    match body.await {
        Ok(Outcome::Ok(value)) => {
            try_outcome!(tx.commit(cx).await);
            tracing::info!(serial, "Committed transaction");
            Outcome::Ok(value)
        }
        Ok(Outcome::Err(e)) => {
            tracing::debug!(serial, error = %e, "Transaction body failed");
            rollback_quietly(cx, &tx, serial).await;
            Outcome::Err(e)
        }
        Ok(Outcome::Cancelled(reason)) => {
            rollback_quietly(cx, &tx, serial).await;
            Outcome::Cancelled(reason)
        }
        Ok(Outcome::Panicked(payload)) => {
            rollback_quietly(cx, &tx, serial).await;
            Outcome::Panicked(payload)
        }
        Err(panic) => {
            tracing::error!(serial, panic = %panic_message(panic.as_ref()), "Transaction body panicked, rolling back");
            rollback_quietly(cx, &tx, serial).await;
            resume_unwind(panic)
        }
    }
}

// ============================================================================
// Public helpers
// ============================================================================

/// Run `f` in a transaction with default options.
///
/// Inside a transaction the body runs on the enclosing one.
pub async fn transaction<T, F, Fut>(cx: &Cx, ctx: &Ctx, f: F) -> Outcome<T, Error>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    transaction_opts(cx, ctx, None, f).await
}

/// Run `f` in a transaction opened with `opts`.
///
/// Inside a transaction the body runs on the enclosing one, provided
/// `opts` is compatible with the enclosing options; otherwise an
/// `IncompatibleOptions` error is returned without touching the driver.
pub async fn transaction_opts<T, F, Fut>(
    cx: &Cx,
    ctx: &Ctx,
    opts: Option<TxOptions>,
    f: F,
) -> Outcome<T, Error>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    if ctx.is_without_transactions() {
        return f(ctx.clone()).await;
    }
    let conn = ctx.conn();
    if let Some(info) = conn.transaction_info() {
        try_outcome!(check_tx_options_compatibility(info.opts, opts));
        tracing::debug!(serial = info.serial, "Joining enclosing transaction");
        return f(ctx.clone()).await;
    }
    run_transaction(cx, ctx, &conn, opts, f).await
}

/// Run `f` in a read-only transaction.
pub async fn transaction_read_only<T, F, Fut>(cx: &Cx, ctx: &Ctx, f: F) -> Outcome<T, Error>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    transaction_opts(cx, ctx, Some(TxOptions::read_only()), f).await
}

/// Run `f` in a new transaction even when `ctx` is already inside one.
///
/// The new transaction is opened on the connection the enclosing
/// transaction was started from and commits independently of it.
pub async fn isolated_transaction<T, F, Fut>(
    cx: &Cx,
    ctx: &Ctx,
    opts: Option<TxOptions>,
    f: F,
) -> Outcome<T, Error>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    if ctx.is_without_transactions() {
        return f(ctx.clone()).await;
    }
    let mut root = ctx.conn();
    while let Some(parent) = root.parent_connection() {
        root = parent;
    }
    let fresh = ctx.with_serialized(false);
    run_transaction(cx, &fresh, &root, opts, f).await
}

/// Run `f` in a serializable transaction, retrying it on serialization
/// failures.
///
/// The body runs at most [`serialized_transaction_retries`] times. Called
/// inside a serialized transaction the body runs on the enclosing one;
/// called inside any other transaction it fails with `NotSerialized`.
pub async fn serialized_transaction<T, F, Fut>(cx: &Cx, ctx: &Ctx, mut f: F) -> Outcome<T, Error>
where
    F: FnMut(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    if ctx.is_without_transactions() {
        return f(ctx.clone()).await;
    }
    if ctx.conn().is_transaction() {
        if ctx.is_serialized() {
            return f(ctx.clone()).await;
        }
        return Outcome::Err(Error::transaction(
            TransactionErrorKind::NotSerialized,
            "serialized transaction requested inside a non-serialized transaction",
        ));
    }

    let serialized = ctx.with_serialized(true);
    let attempts = serialized_transaction_retries();
    let mut last_error = None;
    for attempt in 1..=attempts {
        match transaction_opts(cx, &serialized, Some(TxOptions::serializable()), &mut f).await {
            Outcome::Err(e) if e.is_serialization_failure() => {
                tracing::warn!(attempt, attempts, error = %e, "Serialization failure, retrying transaction");
                last_error = Some(e);
            }
            other => return other,
        }
    }
    Outcome::Err(Error::Transaction(TransactionError {
        kind: TransactionErrorKind::RetriesExhausted,
        message: format!("serialized transaction failed after {attempts} attempts"),
        source: last_error.map(Box::new),
    }))
}

/// Run `f` inside a savepoint of the enclosing transaction.
///
/// Outside a transaction this is [`transaction`]. On failure the work
/// since the savepoint is rolled back and the enclosing transaction stays
/// usable.
pub async fn transaction_savepoint<T, F, Fut>(cx: &Cx, ctx: &Ctx, f: F) -> Outcome<T, Error>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    if ctx.is_without_transactions() {
        return f(ctx.clone()).await;
    }
    let conn = ctx.conn();
    if !conn.is_transaction() {
        return transaction(cx, ctx, f).await;
    }

    let name = format!("sp_{}", NEXT_SAVEPOINT.fetch_add(1, Ordering::SeqCst));
    try_outcome!(conn.exec(cx, &format!("SAVEPOINT {name}"), &[]).await);
    tracing::debug!(savepoint = %name, "Created savepoint");

    let outcome = f(ctx.clone()).await;
    if let Outcome::Ok(_) = outcome {
        try_outcome!(conn.exec(cx, &format!("RELEASE SAVEPOINT {name}"), &[]).await);
        return outcome;
    }

    match conn.exec(cx, &format!("ROLLBACK TO SAVEPOINT {name}"), &[]).await {
        Outcome::Ok(_) => outcome,
        Outcome::Err(rollback_err) => {
            tracing::warn!(savepoint = %name, error = %rollback_err, "Rollback to savepoint failed");
            let source = match outcome {
                Outcome::Err(e) => Some(Box::new(e)),
                _ => None,
            };
            Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::SavepointRollback,
                message: format!("rollback to savepoint {name} failed: {rollback_err}"),
                source,
            }))
        }
        Outcome::Cancelled(_) | Outcome::Panicked(_) => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::exec;
    use crate::testing::{block_on, mock_ctx, unwrap_outcome};
    use sqldb_core::Value;
    use sqldb_mock::CallKind;
    use std::sync::atomic::AtomicUsize;

    fn serialization_failure() -> Error {
        Error::from_sqlstate("40001", "could not serialize access due to concurrent update")
    }

    #[test]
    fn test_commit_on_success() {
        let (driver, ctx) = mock_ctx();
        let value = block_on(|cx| async move {
            unwrap_outcome(
                transaction(&cx, &ctx, |tx| async move {
                    assert!(is_transaction(&tx));
                    try_outcome!(exec(&cx, &tx, "UPDATE t SET a = 1", &[]).await);
                    Outcome::Ok(5)
                })
                .await,
            )
        });
        assert_eq!(value, 5);
        assert_eq!(driver.queries(), ["BEGIN", "UPDATE t SET a = 1", "COMMIT"]);
        let tx_ids: Vec<Option<u64>> = driver.calls().iter().map(|c| c.tx).collect();
        assert!(tx_ids.iter().all(|id| id.is_some() && *id == tx_ids[0]));
    }

    #[test]
    fn test_rollback_on_error() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            let outcome: Outcome<(), Error> =
                transaction(&cx, &ctx, |_tx| async move { Outcome::Err(Error::custom("nope")) }).await;
            match outcome {
                Outcome::Err(e) => assert_eq!(e.to_string(), "nope"),
                _ => panic!("expected the body error"),
            }
        });
        assert_eq!(driver.queries(), ["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn test_panic_rolls_back_then_resumes() {
        let (driver, ctx) = mock_ctx();
        let result = block_on(|cx| async move {
            CatchUnwind {
                inner: Box::pin(transaction(&cx, &ctx, |_tx| async move {
                    if true {
                        panic!("body exploded");
                    }
                    Outcome::<(), Error>::Ok(())
                })),
            }
            .await
        });
        let Err(panic) = result else {
            panic!("the body panic must propagate");
        };
        assert_eq!(panic_message(panic.as_ref()), "body exploded");
        assert_eq!(driver.queries(), ["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn test_nested_transaction_passes_through() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(
                transaction(&cx, &ctx, |outer| async move {
                    let outer_serial = outer.conn().transaction_info().map(|i| i.serial);
                    transaction(&cx, &outer, |inner| async move {
                        assert_eq!(inner.conn().transaction_info().map(|i| i.serial), outer_serial);
                        exec(&cx, &inner, "SELECT 1", &[]).await
                    })
                    .await
                })
                .await,
            );
        });
        assert_eq!(driver.queries(), ["BEGIN", "SELECT 1", "COMMIT"]);
    }

    #[test]
    fn test_incompatible_nested_options_fail_before_driver_call() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            let outcome = transaction_read_only(&cx, &ctx, |outer| async move {
                let inner: Outcome<(), Error> = transaction(&cx, &outer, |_| async { Outcome::Ok(()) }).await;
                assert!(matches!(inner, Outcome::Ok(())));

                let raised = transaction_opts(
                    &cx,
                    &outer,
                    Some(TxOptions {
                        isolation: IsolationLevel::Serializable,
                        read_only: true,
                    }),
                    |_| async { Outcome::Ok(()) },
                )
                .await;
                match raised {
                    Outcome::Err(e) => assert_eq!(e.transaction_kind(), Some(TransactionErrorKind::IncompatibleOptions)),
                    _ => panic!("stricter isolation must be rejected"),
                }

                let writable = transaction_opts(&cx, &outer, Some(TxOptions::new()), |_| async { Outcome::Ok(()) }).await;
                match writable {
                    Outcome::Err(e) => assert_eq!(e.transaction_kind(), Some(TransactionErrorKind::IncompatibleOptions)),
                    _ => panic!("read-write inside read-only must be rejected"),
                }
                Outcome::Ok(())
            })
            .await;
            unwrap_outcome(outcome);
        });
        assert_eq!(driver.queries(), ["BEGIN", "COMMIT"]);
    }

    #[test]
    fn test_compatibility_rules() {
        let serializable = TxOptions::serializable();
        let repeatable = TxOptions::new().isolation(IsolationLevel::RepeatableRead);
        assert!(check_tx_options_compatibility(Some(serializable), Some(repeatable)).is_ok());
        assert!(check_tx_options_compatibility(Some(repeatable), Some(serializable)).is_err());
        assert!(check_tx_options_compatibility(None, Some(TxOptions::read_only())).is_ok());
        assert!(check_tx_options_compatibility(Some(TxOptions::read_only()), None).is_ok());
        assert!(check_tx_options_compatibility(None, Some(serializable)).is_err());
    }

    #[test]
    fn test_serialized_transaction_retries_serialization_failures() {
        let (driver, ctx) = mock_ctx();
        driver.on_exec(|query, _| {
            if query.starts_with("UPDATE") {
                Err(Error::from_sqlstate("40001", "could not serialize access due to concurrent update"))
            } else {
                Ok(0)
            }
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let flaky = Arc::new(AtomicUsize::new(3));

        block_on(|cx| async move {
            let outcome = serialized_transaction(&cx, &ctx, |tx| {
                let counter = Arc::clone(&counter);
                let flaky = Arc::clone(&flaky);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert!(tx.is_serialized());
                    if flaky.load(Ordering::SeqCst) > 0 {
                        flaky.fetch_sub(1, Ordering::SeqCst);
                        try_outcome!(exec(cx, &tx, "UPDATE t SET a = 1", &[]).await);
                    }
                    Outcome::Ok(())
                }
            })
            .await;
            unwrap_outcome(outcome);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        let begins = driver.calls().iter().filter(|c| c.kind == CallKind::Begin).count();
        let rollbacks = driver.calls().iter().filter(|c| c.kind == CallKind::Rollback).count();
        assert_eq!((begins, rollbacks), (4, 3));
    }

    #[test]
    fn test_serialized_transaction_retries_message_only_failures() {
        let (driver, ctx) = mock_ctx();
        let flaky = Arc::new(AtomicUsize::new(3));
        let remaining = Arc::clone(&flaky);
        driver.on_exec(move |_, _| {
            if remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                Err(Error::custom(
                    "could not serialize access due to read/write dependencies among transactions",
                ))
            } else {
                Ok(1)
            }
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let affected = block_on(|cx| async move {
            unwrap_outcome(
                serialized_transaction(&cx, &ctx, |tx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { exec(cx, &tx, "UPDATE t SET a = a + 1", &[]).await }
                })
                .await,
            )
        });
        assert_eq!(affected, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(flaky.load(Ordering::SeqCst), 0);
        let commits = driver.calls().iter().filter(|c| c.kind == CallKind::Commit).count();
        assert_eq!(commits, 1);
    }

    #[test]
    fn test_serialized_transaction_gives_up() {
        let (driver, ctx) = mock_ctx();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        block_on(|cx| async move {
            let outcome: Outcome<(), Error> = serialized_transaction(&cx, &ctx, |_tx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Outcome::Err(serialization_failure()) }
            })
            .await;
            match outcome {
                Outcome::Err(e) => {
                    assert_eq!(e.transaction_kind(), Some(TransactionErrorKind::RetriesExhausted));
                    assert!(e.to_string().contains("could not serialize access"));
                }
                _ => panic!("expected retries to run out"),
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), serialized_transaction_retries());
        assert!(driver.calls().iter().all(|c| c.kind != CallKind::Commit));
    }

    #[test]
    fn test_serialized_inside_plain_transaction_is_rejected() {
        let (_driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            let outcome = transaction(&cx, &ctx, |tx| async move {
                serialized_transaction(&cx, &tx, |_| async { Outcome::Ok(()) }).await
            })
            .await;
            match outcome {
                Outcome::Err(e) => assert_eq!(e.transaction_kind(), Some(TransactionErrorKind::NotSerialized)),
                _ => panic!("expected NotSerialized"),
            }
        });
    }

    #[test]
    fn test_nested_serialized_transaction_passes_through() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(
                serialized_transaction(cx, &ctx, |tx| async move {
                    serialized_transaction(cx, &tx, |inner| async move {
                        exec(cx, &inner, "SELECT 1", &[]).await
                    })
                    .await
                })
                .await,
            );
        });
        assert_eq!(driver.queries(), ["BEGIN", "SELECT 1", "COMMIT"]);
    }

    #[test]
    fn test_savepoint_rolls_back_only_its_work() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(
                transaction(&cx, &ctx, |tx| async move {
                    try_outcome!(exec(&cx, &tx, "INSERT a", &[]).await);
                    let inner: Outcome<(), Error> = transaction_savepoint(&cx, &tx, |sp| async move {
                        try_outcome!(exec(&cx, &sp, "INSERT b", &[]).await);
                        Outcome::Err(Error::custom("undo b"))
                    })
                    .await;
                    assert!(matches!(inner, Outcome::Err(_)));
                    unwrap_outcome(transaction_savepoint(&cx, &tx, |sp| async move {
                        exec(&cx, &sp, "INSERT c", &[]).await
                    })
                    .await);
                    Outcome::Ok(())
                })
                .await,
            );
        });

        let queries = driver.queries();
        assert_eq!(queries.len(), 9);
        assert_eq!(queries[0], "BEGIN");
        assert_eq!(queries[1], "INSERT a");
        let sp1 = queries[2].strip_prefix("SAVEPOINT ").unwrap().to_string();
        assert!(sp1.starts_with("sp_"));
        assert_eq!(queries[3], "INSERT b");
        assert_eq!(queries[4], format!("ROLLBACK TO SAVEPOINT {sp1}"));
        let sp2 = queries[5].strip_prefix("SAVEPOINT ").unwrap().to_string();
        assert_ne!(sp1, sp2);
        assert_eq!(queries[6], "INSERT c");
        assert_eq!(queries[7], format!("RELEASE SAVEPOINT {sp2}"));
        assert_eq!(queries[8], "COMMIT");
    }

    #[test]
    fn test_failed_savepoint_rollback_wraps_body_error() {
        let (driver, ctx) = mock_ctx();
        driver.on_exec(|query, _| {
            if query.starts_with("ROLLBACK TO") {
                Err(Error::custom("connection lost"))
            } else {
                Ok(0)
            }
        });
        block_on(|cx| async move {
            let outcome = transaction(&cx, &ctx, |tx| async move {
                transaction_savepoint(&cx, &tx, |_| async { Outcome::<(), Error>::Err(Error::custom("body failed")) }).await
            })
            .await;
            match outcome {
                Outcome::Err(Error::Transaction(t)) => {
                    assert_eq!(t.kind, TransactionErrorKind::SavepointRollback);
                    assert_eq!(t.source.map(|s| s.to_string()).as_deref(), Some("body failed"));
                }
                _ => panic!("expected savepoint rollback error"),
            }
        });
    }

    #[test]
    fn test_savepoint_outside_transaction_opens_one() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(transaction_savepoint(&cx, &ctx, |tx| async move { exec(&cx, &tx, "SELECT 1", &[]).await }).await);
        });
        assert_eq!(driver.queries(), ["BEGIN", "SELECT 1", "COMMIT"]);
    }

    #[test]
    fn test_isolated_transaction_is_independent() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(
                transaction(&cx, &ctx, |outer| async move {
                    let outer_serial = outer.conn().transaction_info().map(|i| i.serial);
                    unwrap_outcome(
                        isolated_transaction(&cx, &outer, None, |inner| async move {
                            assert_ne!(inner.conn().transaction_info().map(|i| i.serial), outer_serial);
                            exec(&cx, &inner, "INSERT audit", &[Value::from("x")]).await
                        })
                        .await,
                    );
                    Outcome::Ok(())
                })
                .await,
            );
        });
        let calls = driver.calls();
        let kinds: Vec<CallKind> = calls.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            [CallKind::Begin, CallKind::Begin, CallKind::Exec, CallKind::Commit, CallKind::Commit]
        );
        assert_ne!(calls[0].tx, calls[1].tx);
        assert_eq!(calls[2].tx, calls[1].tx);
        assert_eq!(calls[3].tx, calls[1].tx);
        assert_eq!(calls[4].tx, calls[0].tx);
    }

    #[test]
    fn test_without_transactions_runs_body_directly() {
        let (driver, ctx) = mock_ctx();
        let ctx = ctx.without_transactions();
        block_on(|cx| async move {
            unwrap_outcome(transaction(&cx, &ctx, |tx| async move {
                assert!(!is_transaction(&tx));
                exec(&cx, &tx, "SELECT 1", &[]).await
            })
            .await);
            unwrap_outcome(serialized_transaction(&cx, &ctx, |_| async { Outcome::Ok(()) }).await);
            unwrap_outcome(transaction_savepoint(&cx, &ctx, |_| async { Outcome::Ok(()) }).await);
        });
        assert_eq!(driver.queries(), ["SELECT 1"]);
    }
}
