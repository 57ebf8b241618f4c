// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Module host: lifecycle and per-module state for worker-thread service
//! modules.

mod loader;
mod worker;

pub use loader::{
    find_module, module_name_from_path, DsoLoader, LoadedModule, ModuleLoader,
    RegistryLoader, MODULE_CREATE_SYMBOL,
};
pub use worker::{ModuleContext, ModuleMain, ModuleOutput};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use broker_data::error::Errno;
use broker_data::message::{AsyncQueue, Credentials, Message, ModuleStatus};
use indexmap::IndexMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::RouteTarget;

/// Per-module state owned by the host. Workers never touch this; status
/// changes arrive as keepalive messages and are materialized here by the
/// router.
pub struct Module {
    pub name: String,
    pub uuid: String,
    pub path: String,
    pub status: ModuleStatus,
    pub errnum: u32,
    /// Zero-or-one load request awaiting a terminal response.
    pub pending_insmod: Option<Message>,
    /// Racy unload requests may pile up; all are answered on exit.
    pub pending_rmmod: Vec<Message>,
    /// Topic prefixes this module subscribed to.
    pub subscriptions: Vec<String>,
    /// Services this module has sent a first-party request to; each gets a
    /// synthetic disconnect when the module exits.
    pub services_used: Vec<String>,

    inbound: AsyncQueue<Message>,
    muted: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Module {
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }
}

/// Forwards switch-routed requests onto a module's inbound channel. A
/// muted or torn-down module reports ENOSYS so the caller sees the same
/// failure as an unregistered service.
struct ModuleTarget {
    inbound: AsyncQueue<Message>,
    muted: Arc<AtomicBool>,
}

impl RouteTarget for ModuleTarget {
    fn deliver(&self, msg: &Message) -> Result<(), Errno> {
        if self.muted.load(Ordering::Acquire) {
            return Err(Errno::NoSys);
        }
        self.inbound
            .try_send(msg.clone())
            .map_err(|_| Errno::NoSys)
    }
}

pub struct ModuleHost {
    modules: IndexMap<String, Module>,
    names: HashMap<String, String>,
    outbound: AsyncQueue<ModuleOutput>,
    /// Default credentials for module-originated messages.
    cred: Credentials,
}

impl ModuleHost {
    pub fn new(cred: Credentials) -> Self {
        Self {
            modules: IndexMap::new(),
            names: HashMap::new(),
            outbound: AsyncQueue::unbounded("module_outbound"),
            cred,
        }
    }

    /// Shared channel carrying every worker's outbound traffic.
    pub fn outbound(&self) -> &AsyncQueue<ModuleOutput> {
        &self.outbound
    }

    /// Spawns a module worker. The caller registers the module's service
    /// entry with the uuid returned here.
    pub fn insmod(
        &mut self,
        loaded: LoadedModule,
        path: &str,
        args: Vec<String>,
        request: Option<Message>,
    ) -> Result<String, Errno> {
        let LoadedModule {
            name,
            main,
            library,
        } = loaded;
        if self.names.contains_key(&name) {
            return Err(Errno::Exist);
        }
        let uuid = Uuid::new_v4().simple().to_string();
        let inbound = AsyncQueue::unbounded("module_inbound");
        let ctx = ModuleContext::new(
            name.clone(),
            uuid.clone(),
            args,
            self.cred,
            inbound.clone(),
            self.outbound.clone(),
        );
        let thread = thread::Builder::new()
            .name(format!("module-{name}"))
            .spawn(move || worker::run_module(main, ctx, library))
            .map_err(|_| Errno::NoMem)?;

        debug!("insmod {}", name);
        self.names.insert(name.clone(), uuid.clone());
        self.modules.insert(
            uuid.clone(),
            Module {
                name,
                uuid: uuid.clone(),
                path: path.to_string(),
                status: ModuleStatus::Init,
                errnum: 0,
                pending_insmod: request,
                pending_rmmod: Vec::new(),
                subscriptions: Vec::new(),
                services_used: Vec::new(),
                inbound,
                muted: Arc::new(AtomicBool::new(false)),
                thread: Some(thread),
            },
        );
        Ok(uuid)
    }

    /// Asks a module to finalize, stashing the unload request for a
    /// response on exit.
    pub fn rmmod(
        &mut self,
        name: &str,
        request: Option<Message>,
    ) -> Result<(), Errno> {
        let uuid = self.names.get(name).ok_or(Errno::NoEnt)?.clone();
        let module = self.modules.get_mut(&uuid).ok_or(Errno::NoEnt)?;
        Self::stop(module);
        if let Some(request) = request {
            module.pending_rmmod.push(request);
        }
        debug!("rmmod {}", name);
        Ok(())
    }

    /// Asks every module to finalize, most recently loaded first.
    pub fn stop_all(&mut self) {
        for module in self.modules.values_mut().rev() {
            Self::stop(module);
        }
    }

    fn stop(module: &mut Module) {
        let stop = Message::new_keepalive(0, ModuleStatus::Finalizing);
        if module.inbound.try_send(stop).is_err() {
            warn!("module {}: stop request not delivered", module.name);
        }
    }

    /// Marks the module muted: no further requests or events are delivered
    /// to it; responses in flight still are.
    pub fn mute(&mut self, uuid: &str) {
        if let Some(module) = self.modules.get(uuid) {
            module.muted.store(true, Ordering::Release);
        }
    }

    /// Echoes a finalizing keepalive back to the worker so its drain loop
    /// can proceed.
    pub fn echo_keepalive(&self, uuid: &str, msg: Message) {
        if let Some(module) = self.modules.get(uuid) {
            if module.inbound.try_send(msg).is_err() {
                warn!("module {}: keepalive echo not delivered", module.name);
            }
        }
    }

    /// Materializes a status transition, returning the previous status.
    pub fn set_status(
        &mut self,
        uuid: &str,
        status: ModuleStatus,
        errnum: u32,
    ) -> Option<ModuleStatus> {
        let module = self.modules.get_mut(uuid)?;
        let prev = module.status;
        module.status = status;
        if status == ModuleStatus::Exited {
            module.errnum = errnum;
        }
        Some(prev)
    }

    /// Removes an exited module, joining its worker thread. The returned
    /// entry still carries any pending responses and armed disconnects.
    pub fn remove(&mut self, uuid: &str) -> Option<Module> {
        let mut module = self.modules.shift_remove(uuid)?;
        self.names.remove(&module.name);
        module.inbound.close();
        if let Some(thread) = module.thread.take() {
            if thread.join().is_err() {
                warn!("module {}: worker thread panicked", module.name);
            }
        }
        debug!("module {} exited", module.name);
        Some(module)
    }

    pub fn get(&self, uuid: &str) -> Option<&Module> {
        self.modules.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Module> {
        self.modules.get_mut(uuid)
    }

    pub fn uuid_by_name(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Switch target delivering to this module.
    pub fn target(&self, uuid: &str) -> Option<Box<dyn RouteTarget>> {
        self.modules.get(uuid).map(|module| {
            Box::new(ModuleTarget {
                inbound: module.inbound.clone(),
                muted: module.muted.clone(),
            }) as Box<dyn RouteTarget>
        })
    }

    /// Routes a response to the module named by the route-stack tail.
    /// ENOSYS if no such module remains.
    pub fn send_response(&self, mut msg: Message) -> Result<(), Errno> {
        let uuid = msg.route.pop().ok_or(Errno::Inval)?;
        let module = self.modules.get(&uuid).ok_or(Errno::NoSys)?;
        module.inbound.try_send(msg).map_err(|_| Errno::NoSys)
    }

    /// Multicasts an event to every non-muted module with a matching
    /// subscription prefix.
    pub fn event_mcast(&self, msg: &Message) {
        let topic = match msg.topic() {
            Some(topic) => topic,
            None => return,
        };
        for module in self.modules.values() {
            if module.is_muted() {
                continue;
            }
            if module
                .subscriptions
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_str()))
            {
                if module.inbound.try_send(msg.clone()).is_err() {
                    warn!("module {}: event not delivered", module.name);
                }
            }
        }
    }

    pub fn subscribe(
        &mut self,
        uuid: &str,
        topic: impl Into<String>,
    ) -> Result<(), Errno> {
        let module = self.modules.get_mut(uuid).ok_or(Errno::NoEnt)?;
        module.subscriptions.push(topic.into());
        Ok(())
    }

    /// Drops one matching subscription; unsubscribing a topic that was
    /// never subscribed is a no-op.
    pub fn unsubscribe(&mut self, uuid: &str, topic: &str) -> Result<(), Errno> {
        let module = self.modules.get_mut(uuid).ok_or(Errno::NoEnt)?;
        if let Some(pos) =
            module.subscriptions.iter().position(|s| s == topic)
        {
            module.subscriptions.remove(pos);
        }
        Ok(())
    }

    /// Records a service a module sent a first-party request to, for the
    /// disconnect cascade on unload.
    pub fn arm_disconnect(&mut self, uuid: &str, service: &str) {
        if let Some(module) = self.modules.get_mut(uuid) {
            if !module.services_used.iter().any(|s| s == service) {
                module.services_used.push(service.to_string());
            }
        }
    }

    /// Snapshot for `broker.lsmod`.
    pub fn list(&self) -> Vec<&Module> {
        self.modules.values().collect()
    }
}
