//! One dedicated LISTEN connection and its dispatch thread.

use crate::{ListenerHolder, ListenerSettings, OnNotify, OnUnlisten};
use sqldb_core::{ListenerConn, ListenerConnector, ListenerEvent, Notification, Result};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Callbacks registered for one channel.
#[derive(Default, Clone)]
struct Subscribers {
    on_notify: Vec<OnNotify>,
    on_unlisten: Vec<OnUnlisten>,
}

/// Run a user callback, logging and swallowing a panic.
pub(crate) fn guarded(what: &str, channel: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(channel = %channel, callback = what, panic = %message, "Listener callback panicked");
    }
}

fn run_unlisten_callbacks(channel: &str, callbacks: &[OnUnlisten]) {
    for callback in callbacks {
        guarded("unlisten", channel, || callback(channel));
    }
}

/// A LISTEN connection shared by every subscriber of one URL.
pub(crate) struct Listener {
    url: String,
    settings: ListenerSettings,
    connector: Arc<dyn ListenerConnector>,
    conn: Mutex<Arc<dyn ListenerConn>>,
    events: Sender<ListenerEvent>,
    channels: RwLock<HashMap<String, Subscribers>>,
    holders: Mutex<HashSet<ListenerHolder>>,
    stopped: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Connect and start the dispatch thread.
    pub(crate) fn start(
        url: &str,
        connector: Arc<dyn ListenerConnector>,
        settings: ListenerSettings,
    ) -> Result<Arc<Self>> {
        let (events, rx) = mpsc::channel();
        let conn = connector.connect(url, events.clone())?;
        let listener = Arc::new(Self {
            url: url.to_string(),
            settings,
            connector,
            conn: Mutex::new(conn),
            events,
            channels: RwLock::new(HashMap::new()),
            holders: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let worker = Arc::clone(&listener);
        let handle = thread::Builder::new()
            .name("sqldb-listener".to_string())
            .spawn(move || worker.run(&rx))?;
        *lock(&listener.thread) = Some(handle);

        tracing::info!(url = %listener.url, "Listener started");
        Ok(listener)
    }

    fn current_conn(&self) -> Arc<dyn ListenerConn> {
        Arc::clone(&lock(&self.conn))
    }

    pub(crate) fn listen(
        &self,
        channel: &str,
        on_notify: Option<OnNotify>,
        on_unlisten: Option<OnUnlisten>,
    ) -> Result<()> {
        self.current_conn().listen(channel)?;
        let mut channels = write(&self.channels);
        let subscribers = channels.entry(channel.to_string()).or_default();
        subscribers.on_notify.extend(on_notify);
        subscribers.on_unlisten.extend(on_unlisten);
        tracing::debug!(url = %self.url, channel = %channel, "Listening on channel");
        Ok(())
    }

    pub(crate) fn unlisten(&self, channel: &str) -> Result<()> {
        let result = self.current_conn().unlisten(channel);
        let removed = write(&self.channels).remove(channel);
        if let Some(subscribers) = removed {
            run_unlisten_callbacks(channel, &subscribers.on_unlisten);
        }
        tracing::debug!(url = %self.url, channel = %channel, "Stopped listening on channel");
        result
    }

    pub(crate) fn hold(&self, holder: Option<ListenerHolder>) {
        if let Some(holder) = holder {
            lock(&self.holders).insert(holder);
        }
    }

    /// Remove `holder`; true when it was the last one.
    pub(crate) fn release(&self, holder: ListenerHolder) -> bool {
        let mut holders = lock(&self.holders);
        holders.remove(&holder) && holders.is_empty()
    }

    pub(crate) fn is_listening(&self, channel: &str) -> bool {
        read(&self.channels).contains_key(channel)
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = read(&self.channels).keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Stop the dispatch thread, close the connection and run the unlisten
    /// callbacks of every remaining channel.
    pub(crate) fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ListenerEvent::Closed);
        if let Err(e) = self.current_conn().close() {
            tracing::warn!(url = %self.url, error = %e, "Failed to close listener connection");
        }

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            // A callback may close its own listener.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(url = %self.url, "Listener thread panicked");
            }
        }

        let channels: Vec<(String, Subscribers)> = write(&self.channels).drain().collect();
        for (channel, subscribers) in channels {
            run_unlisten_callbacks(&channel, &subscribers.on_unlisten);
        }
        tracing::info!(url = %self.url, "Listener closed");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Dispatch thread
    // ------------------------------------------------------------------

    fn run(&self, rx: &Receiver<ListenerEvent>) {
        let keepalive = self.settings.keepalive_interval;
        let mut last_ping = Instant::now();
        while !self.is_stopped() {
            let wait = keepalive.saturating_sub(last_ping.elapsed());
            match rx.recv_timeout(wait) {
                Ok(ListenerEvent::Notification(notification)) => self.dispatch(&notification),
                Ok(ListenerEvent::Disconnected(err)) => {
                    tracing::warn!(url = %self.url, error = %err, "Listener connection lost");
                    if !self.reconnect(rx) {
                        break;
                    }
                    last_ping = Instant::now();
                }
                // close() sets the stop flag before sending this; a Closed
                // from a connection we dropped ourselves is ignored.
                Ok(ListenerEvent::Closed) => {}
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    last_ping = Instant::now();
                    if let Err(err) = self.current_conn().ping() {
                        tracing::warn!(url = %self.url, error = %err, "Listener keepalive failed");
                        if !self.reconnect(rx) {
                            break;
                        }
                        last_ping = Instant::now();
                    }
                }
            }
        }
        if self.is_stopped() {
            // A reconnect may have raced with close().
            let _ = self.current_conn().close();
        }
        tracing::debug!(url = %self.url, "Listener thread exiting");
    }

    fn dispatch(&self, notification: &Notification) {
        let callbacks = read(&self.channels)
            .get(&notification.channel)
            .map(|s| s.on_notify.clone())
            .unwrap_or_default();
        tracing::trace!(
            channel = %notification.channel,
            callbacks = callbacks.len(),
            "Dispatching notification"
        );
        for callback in &callbacks {
            guarded("notify", &notification.channel, || {
                callback(&notification.channel, &notification.payload);
            });
        }
    }

    /// Wait for `delay`, returning `false` when the listener was closed
    /// meanwhile.
    fn wait(&self, rx: &Receiver<ListenerEvent>, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_stopped() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            match rx.recv_timeout(remaining) {
                Err(RecvTimeoutError::Disconnected) => return false,
                // Stale events from the dead connection, or the wake-up
                // sent by close().
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return !self.is_stopped(),
            }
        }
    }

    /// Reconnect with exponential backoff and re-issue LISTEN for every
    /// registered channel.
    fn reconnect(&self, rx: &Receiver<ListenerEvent>) -> bool {
        // Release the dead connection's resources before opening another.
        if let Err(err) = self.current_conn().close() {
            tracing::debug!(url = %self.url, error = %err, "Closing lost listener connection failed");
        }
        let mut delay = self.settings.min_reconnect_interval;
        loop {
            if !self.wait(rx, delay) {
                return false;
            }
            match self.try_reconnect() {
                Ok(()) => {
                    tracing::info!(url = %self.url, "Listener reconnected");
                    return true;
                }
                Err(err) => {
                    delay = (delay * 2).min(self.settings.max_reconnect_interval);
                    tracing::warn!(
                        url = %self.url,
                        error = %err,
                        retry_in = ?delay,
                        "Listener reconnect failed"
                    );
                }
            }
        }
    }

    fn try_reconnect(&self) -> Result<()> {
        let conn = self.connector.connect(&self.url, self.events.clone())?;
        for channel in self.channels() {
            if let Err(err) = conn.listen(&channel) {
                let _ = conn.close();
                return Err(err);
            }
        }
        *lock(&self.conn) = conn;
        Ok(())
    }
}
