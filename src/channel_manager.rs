use crate::errors::*;
use crate::wire::ChannelWireConnection;
use crate::Channel;
use log::debug;
use std::collections::btree_map::{BTreeMap, Entry};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

/// The registry of live channels on one connection.
///
/// Every open [`Channel`] handed to the application is tracked here until it is closed by
/// the application, closed by the server, or swept up by a connection shutdown.
#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Mutex<Registry>,
    drained: Condvar,
}

struct Registry {
    channels: BTreeMap<u16, Channel>,
    closed: Option<Arc<Error>>,
}

/// Non-owning reference from a channel back to its manager.
#[derive(Clone)]
pub(crate) struct WeakChannelManager(Weak<Shared>);

impl WeakChannelManager {
    pub(crate) fn upgrade(&self) -> Option<ChannelManager> {
        self.0.upgrade().map(|shared| ChannelManager { shared })
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        ChannelManager::new()
    }
}

impl ChannelManager {
    pub fn new() -> ChannelManager {
        ChannelManager {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    channels: BTreeMap::new(),
                    closed: None,
                }),
                drained: Condvar::new(),
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.shared.registry.lock().unwrap()
    }

    fn downgrade(&self) -> WeakChannelManager {
        WeakChannelManager(Arc::downgrade(&self.shared))
    }

    fn notify_if_drained(&self, registry: &Registry) {
        if registry.channels.is_empty() {
            self.shared.drained.notify_all();
        }
    }

    /// Opens a new channel on `conn` and registers it. Opening and registering happen under
    /// the registry lock, so concurrent callers never observe a half-registered channel.
    pub fn create_channel(&self, conn: &Arc<ChannelWireConnection>) -> Result<Channel> {
        let mut registry = self.lock();
        if registry.closed.is_some() {
            return ConnectionClosedSnafu.fail();
        }
        let channel = conn.channel_open()?;
        let channel_id = channel.channel_id();
        match registry.channels.entry(channel_id) {
            Entry::Occupied(_) => panic!("duplicate channel {} registered", channel_id),
            Entry::Vacant(vacant) => {
                vacant.insert(channel.clone());
            }
        }
        channel.attach(self.downgrade());
        Ok(channel)
    }

    /// Removes a channel the application is closing and closes it on the wire; `reason` is
    /// recorded on the handle. Unknown channels (already removed) are ignored.
    pub fn close_channel(&self, channel_id: u16, reason: Error) -> Result<()> {
        let channel = {
            let mut registry = self.lock();
            let channel = registry.channels.remove(&channel_id);
            self.notify_if_drained(&registry);
            channel
        };
        match channel {
            Some(channel) => channel.shutdown(Arc::new(reason), true),
            None => {
                debug!("channel {} already removed", channel_id);
                Ok(())
            }
        }
    }

    /// Forgets a channel the server has closed. Nothing is sent; the handle is marked closed
    /// with `reason`. Returns false if the channel was not registered.
    pub fn remove_channel(&self, channel_id: u16, reason: Error) -> bool {
        let channel = {
            let mut registry = self.lock();
            let channel = registry.channels.remove(&channel_id);
            self.notify_if_drained(&registry);
            channel
        };
        match channel {
            Some(channel) => {
                channel.mark_closed(Arc::new(reason));
                true
            }
            None => false,
        }
    }

    /// Closes every tracked channel with the connection-level `reason` and refuses new ones.
    pub fn notify_connection_close(&self, reason: Error) {
        let reason = Arc::new(reason);
        let channels = {
            let mut registry = self.lock();
            if registry.closed.is_none() {
                registry.closed = Some(Arc::clone(&reason));
            }
            let channels = mem::replace(&mut registry.channels, BTreeMap::new());
            self.notify_if_drained(&registry);
            channels
        };
        debug!(
            "closing {} channel(s) after connection close: {}",
            channels.len(),
            reason
        );
        for channel in channels.values() {
            channel.mark_closed(Arc::clone(&reason));
        }
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// The reason passed to [`notify_connection_close`](#method.notify_connection_close), if
    /// it has been called.
    pub fn close_reason(&self) -> Option<Arc<Error>> {
        self.lock().closed.clone()
    }

    /// Blocks until no channels are registered.
    pub fn wait_until_drained(&self) {
        let mut registry = self.lock();
        while !registry.channels.is_empty() {
            registry = self.shared.drained.wait(registry).unwrap();
        }
    }

    #[cfg(test)]
    fn register(&self, channel: Channel) {
        channel.attach(self.downgrade());
        let mut registry = self.lock();
        match registry.channels.entry(channel.channel_id()) {
            Entry::Occupied(_) => panic!("duplicate channel {} registered", channel.channel_id()),
            Entry::Vacant(vacant) => {
                vacant.insert(channel);
            }
        }
    }
}
