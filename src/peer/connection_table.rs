use rustc_hash::FxHashMap;
use crate::addr::{AddressOrGuid, RakNetGuid, SystemAddress};
use crate::connection::Connection;

/// All connections of a peer, indexed by address and by GUID. The address is the primary key,
///  the GUID index is kept in sync for connections whose remote GUID is known.
#[derive(Default)]
pub struct ConnectionTable {
    by_address: FxHashMap<SystemAddress, Connection>,
    by_guid: FxHashMap<RakNetGuid, SystemAddress>,
}

impl ConnectionTable {
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn insert(&mut self, connection: Connection) {
        let address = connection.address();
        if let Some(old) = self.by_address.remove(&address) {
            self.unindex_guid(&old);
        }
        if !connection.guid().is_unassigned() {
            self.by_guid.insert(connection.guid(), address);
        }
        self.by_address.insert(address, connection);
    }

    pub fn remove(&mut self, address: &SystemAddress) -> Option<Connection> {
        let connection = self.by_address.remove(address)?;
        self.unindex_guid(&connection);
        Some(connection)
    }

    fn unindex_guid(&mut self, connection: &Connection) {
        if self.by_guid.get(&connection.guid()) == Some(&connection.address()) {
            self.by_guid.remove(&connection.guid());
        }
    }

    pub fn get(&self, address: &SystemAddress) -> Option<&Connection> {
        self.by_address.get(address)
    }

    pub fn get_mut(&mut self, address: &SystemAddress) -> Option<&mut Connection> {
        self.by_address.get_mut(address)
    }

    pub fn address_of(&self, guid: &RakNetGuid) -> Option<SystemAddress> {
        self.by_guid.get(guid).copied()
    }

    /// the address of the connection a reference points to, if there is one
    pub fn resolve(&self, target: &AddressOrGuid) -> Option<SystemAddress> {
        match target {
            AddressOrGuid::Address(address) => self.by_address.contains_key(address).then_some(*address),
            AddressOrGuid::Guid(guid) => self.address_of(guid),
        }
    }

    pub fn set_guid(&mut self, address: &SystemAddress, guid: RakNetGuid) {
        if let Some(connection) = self.by_address.get_mut(address) {
            let old_guid = connection.guid();
            connection.set_guid(guid);
            if self.by_guid.get(&old_guid) == Some(address) {
                self.by_guid.remove(&old_guid);
            }
            if !guid.is_unassigned() {
                self.by_guid.insert(guid, *address);
            }
        }
    }

    /// Moves a connection to a new address, e.g. after a NAT rebinding. Returns `false` if there
    ///  is no connection at `from` or a different connection at `to`.
    pub fn change_address(&mut self, from: &SystemAddress, to: SystemAddress) -> bool {
        if from == &to {
            return self.by_address.contains_key(from);
        }
        if self.by_address.contains_key(&to) {
            return false;
        }
        let Some(mut connection) = self.remove(from) else {
            return false;
        };
        connection.set_address(to);
        self.insert(connection);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.by_address.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.by_address.values_mut()
    }

    pub fn addresses(&self) -> Vec<SystemAddress> {
        self.by_address.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.by_address.clear();
        self.by_guid.clear();
    }
}
