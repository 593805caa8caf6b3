//! LISTEN/NOTIFY support for sqldb.
//!
//! A [`ListenerRegistry`] keeps one dedicated connection per connection URL.
//! Each listener runs a background thread that:
//!
//! - dispatches notifications to the callbacks registered for the channel,
//!   each under a panic guard that logs and swallows;
//! - pings the connection every `keepalive_interval`;
//! - reconnects after a lost connection, backing off exponentially from
//!   `min_reconnect_interval` to `max_reconnect_interval`, and re-issues
//!   `LISTEN` for every registered channel.
//!
//! Callbacks run on the listener thread and must not block; offload long
//! work. They may subscribe and unsubscribe from inside a callback.
//!
//! Connections sharing a URL share its listener. Each one subscribes as a
//! [`ListenerHolder`], and the listener stays open until the last holder is
//! released.

mod listener;
mod registry;

pub use registry::{ListenerHolder, ListenerRegistry};

use std::sync::Arc;
use std::time::Duration;

/// Called with `(channel, payload)` for each notification.
pub type OnNotify = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Called with the channel name when a subscription ends, either through
/// `unlisten` or because the listener was closed.
pub type OnUnlisten = Arc<dyn Fn(&str) + Send + Sync>;

/// Shortest keepalive interval a listener uses.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest delay between reconnect attempts.
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(1);

/// Timing of a listener's reconnect and keepalive loops.
///
/// Values are clamped by [`ListenerSettings::normalized`] when a
/// [`ListenerRegistry`] is built, so a zero interval never turns the
/// listener thread into a busy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub min_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub keepalive_interval: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            min_reconnect_interval: Duration::from_secs(10),
            max_reconnect_interval: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(90),
        }
    }
}

impl ListenerSettings {
    /// Clamp the intervals to [`MIN_KEEPALIVE_INTERVAL`] and
    /// [`MIN_RECONNECT_INTERVAL`], and raise the maximum reconnect interval
    /// to at least the minimum.
    pub fn normalized(self) -> Self {
        let min_reconnect_interval = self.min_reconnect_interval.max(MIN_RECONNECT_INTERVAL);
        let normalized = Self {
            min_reconnect_interval,
            max_reconnect_interval: self.max_reconnect_interval.max(min_reconnect_interval),
            keepalive_interval: self.keepalive_interval.max(MIN_KEEPALIVE_INTERVAL),
        };
        if normalized != self {
            tracing::warn!(requested = ?self, using = ?normalized, "Adjusted listener settings");
        }
        normalized
    }
}
