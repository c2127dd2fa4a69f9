use std::sync::Arc;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use crate::addr::{RakNetGuid, SystemAddress};

/// Hooks into a peer's life cycle and traffic. All methods have empty default implementations,
///  so a plugin implements only what it is interested in.
///
/// Callbacks are invoked outside of the peer's internal locks, but they should still return
///  quickly since they run on the peer's I/O and update tasks.
#[cfg_attr(test, automock)]
pub trait PeerPlugin: Send + Sync + 'static {
    fn on_attach(&self) {}
    fn on_detach(&self) {}

    fn on_startup(&self) {}
    fn on_shutdown(&self) {}

    fn on_new_connection(&self, _address: SystemAddress, _guid: RakNetGuid, _is_incoming: bool) {}
    fn on_closed_connection(&self, _address: SystemAddress, _guid: RakNetGuid) {}

    fn on_raw_send(&self, _data: &Bytes, _to: SystemAddress) {}
    fn on_raw_receive(&self, _data: &Bytes, _from: SystemAddress) {}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PluginId(u64);

#[derive(Default)]
pub struct PluginRegistry {
    next_id: u64,
    plugins: FxHashMap<u64, Arc<dyn PeerPlugin>>,
}

impl PluginRegistry {
    pub fn attach(&mut self, plugin: Arc<dyn PeerPlugin>) -> PluginId {
        let id = self.next_id;
        self.next_id += 1;
        plugin.on_attach();
        self.plugins.insert(id, plugin);
        PluginId(id)
    }

    pub fn detach(&mut self, id: PluginId) -> bool {
        match self.plugins.remove(&id.0) {
            Some(plugin) => {
                plugin.on_detach();
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// snapshot for dispatching without holding the registry's lock
    pub fn all(&self) -> Vec<Arc<dyn PeerPlugin>> {
        self.plugins.values().cloned().collect()
    }
}
