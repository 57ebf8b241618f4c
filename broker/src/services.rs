// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Service switch: maps topic prefixes to dispatch targets.

use broker_data::error::Errno;
use broker_data::message::{Credentials, Message};
use indexmap::IndexMap;
use tracing::debug;

/// Dispatch target of a service entry. Built-in targets requeue on the
/// broker's internal handle; module targets forward on the module's inbound
/// channel.
pub trait RouteTarget: Send + Sync {
    fn deliver(&self, msg: &Message) -> Result<(), Errno>;
}

struct ServiceEntry {
    /// Module uuid for module-provided services; None for built-ins.
    owner_uuid: Option<String>,
    target: Box<dyn RouteTarget>,
}

#[derive(Default)]
pub struct ServiceSwitch {
    entries: IndexMap<String, ServiceEntry>,
}

impl ServiceSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. `name` is a topic prefix and need not contain
    /// a dot.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        owner_uuid: Option<String>,
        target: Box<dyn RouteTarget>,
    ) -> Result<(), Errno> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(Errno::Exist);
        }
        debug!(event = "service_add", name = %name);
        self.entries.insert(name, ServiceEntry { owner_uuid, target });
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), Errno> {
        self.entries
            .shift_remove(name)
            .map(|_| debug!(event = "service_remove", name = %name))
            .ok_or(Errno::NoEnt)
    }

    /// Removes all services owned by module uuid `uuid`.
    pub fn remove_by_uuid(&mut self, uuid: &str) {
        self.entries
            .retain(|_, entry| entry.owner_uuid.as_deref() != Some(uuid));
    }

    /// Owning module uuid of a registered service. Built-in services have
    /// no owner and report `ENOENT`, as does an unregistered name.
    pub fn get_uuid(&self, name: &str) -> Result<&str, Errno> {
        self.entries
            .get(name)
            .and_then(|entry| entry.owner_uuid.as_deref())
            .ok_or(Errno::NoEnt)
    }

    /// Names of the services owned by module uuid `uuid`.
    pub fn names_by_uuid(&self, uuid: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.owner_uuid.as_deref() == Some(uuid))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolves the message topic to an entry by longest dotted-prefix
    /// match and invokes its target. `ENOSYS` if no entry matches.
    pub fn send(&self, msg: &Message) -> Result<(), Errno> {
        let topic = msg.topic().ok_or(Errno::Proto)?;
        let mut name = topic;
        loop {
            if let Some(entry) = self.entries.get(name) {
                return entry.target.deliver(msg);
            }
            match name.rfind('.') {
                Some(pos) => name = &name[..pos],
                None => return Err(Errno::NoSys),
            }
        }
    }
}

/// Checks whether requestor `cred` may add/remove service `name`.
/// A guest controls a service iff it is prefixed with `"<userid>-"`.
pub fn service_allow(cred: Credentials, name: &str) -> Result<(), Errno> {
    if cred.is_owner() {
        return Ok(());
    }
    let prefix = format!("{}-", cred.userid);
    if name.starts_with(&prefix) {
        return Ok(());
    }
    Err(Errno::Perm)
}
