//! Process-wide map from connection URL to listener.

use crate::listener::Listener;
use crate::{ListenerSettings, OnNotify, OnUnlisten};
use sqldb_core::{ListenerConnector, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

static GLOBAL: LazyLock<Arc<ListenerRegistry>> =
    LazyLock::new(|| Arc::new(ListenerRegistry::new(ListenerSettings::default())));

/// Identifies one connection sharing a URL's listener.
///
/// Connections subscribe through [`ListenerRegistry::listen_as`] and give up
/// the listener with [`ListenerRegistry::release`]; it is closed once no
/// holder remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHolder(u64);

impl ListenerHolder {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerHolder {
    fn default() -> Self {
        Self::new()
    }
}

/// Listeners keyed by connection URL.
///
/// The first subscription for a URL opens a dedicated connection through
/// the supplied [`ListenerConnector`]; later subscriptions share it.
pub struct ListenerRegistry {
    settings: ListenerSettings,
    listeners: RwLock<HashMap<String, Arc<Listener>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("settings", &self.settings)
            .field("urls", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new(settings: ListenerSettings) -> Self {
        Self {
            settings: settings.normalized(),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Listener>>> {
        self.listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Listener>>> {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn get(&self, url: &str) -> Option<Arc<Listener>> {
        self.read().get(url).cloned()
    }

    /// The listener for `url`, started on first use. `holder` is recorded
    /// while the map lock is held so a concurrent release cannot close the
    /// listener in between.
    fn get_or_start(
        &self,
        url: &str,
        connector: &Arc<dyn ListenerConnector>,
        holder: Option<ListenerHolder>,
    ) -> Result<Arc<Listener>> {
        {
            let listeners = self.read();
            if let Some(listener) = listeners.get(url) {
                listener.hold(holder);
                return Ok(Arc::clone(listener));
            }
        }
        let mut listeners = self.write();
        if let Some(listener) = listeners.get(url) {
            listener.hold(holder);
            return Ok(Arc::clone(listener));
        }
        let listener = Listener::start(url, Arc::clone(connector), self.settings)?;
        listener.hold(holder);
        listeners.insert(url.to_string(), Arc::clone(&listener));
        Ok(listener)
    }

    /// Subscribe to `channel` on the listener for `url`.
    ///
    /// Issues `LISTEN` and appends the callbacks; subscribing twice with
    /// the same callbacks registers them twice.
    pub fn listen(
        &self,
        url: &str,
        connector: &Arc<dyn ListenerConnector>,
        channel: &str,
        on_notify: Option<OnNotify>,
        on_unlisten: Option<OnUnlisten>,
    ) -> Result<()> {
        self.get_or_start(url, connector, None)?
            .listen(channel, on_notify, on_unlisten)
    }

    /// [`listen`](Self::listen) on behalf of `holder`, which keeps the
    /// listener open until it is [released](Self::release).
    pub fn listen_as(
        &self,
        holder: ListenerHolder,
        url: &str,
        connector: &Arc<dyn ListenerConnector>,
        channel: &str,
        on_notify: Option<OnNotify>,
        on_unlisten: Option<OnUnlisten>,
    ) -> Result<()> {
        self.get_or_start(url, connector, Some(holder))?
            .listen(channel, on_notify, on_unlisten)
    }

    /// Drop `holder`'s claim on the listener for `url` and close the
    /// listener when it was the last holder. Returns whether it was closed.
    pub fn release(&self, url: &str, holder: ListenerHolder) -> bool {
        let removed = {
            let mut listeners = self.write();
            let last = listeners.get(url).is_some_and(|l| l.release(holder));
            if last { listeners.remove(url) } else { None }
        };
        match removed {
            Some(listener) => {
                listener.close();
                true
            }
            None => false,
        }
    }

    /// Issue `UNLISTEN`, drop every callback of `channel` and then run its
    /// unlisten callbacks. A no-op for unknown URLs.
    pub fn unlisten(&self, url: &str, channel: &str) -> Result<()> {
        match self.get(url) {
            Some(listener) => listener.unlisten(channel),
            None => Ok(()),
        }
    }

    pub fn is_listening(&self, url: &str, channel: &str) -> bool {
        self.get(url)
            .is_some_and(|listener| listener.is_listening(channel))
    }

    /// Channels with subscribers on the listener for `url`, sorted.
    pub fn channels(&self, url: &str) -> Vec<String> {
        self.get(url)
            .map(|listener| listener.channels())
            .unwrap_or_default()
    }

    /// Close the listener for `url` regardless of its holders. Returns
    /// whether one existed.
    pub fn close(&self, url: &str) -> bool {
        let removed = self.write().remove(url);
        match removed {
            Some(listener) => {
                listener.close();
                true
            }
            None => false,
        }
    }

    /// Close every listener.
    pub fn close_all(&self) {
        let listeners: Vec<Arc<Listener>> = self.write().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.close();
        }
    }

    /// Number of open listeners.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
