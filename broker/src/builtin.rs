// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Built-in broker services, dispatched off the internal handle.

use broker_data::error::Errno;
use broker_data::message::{Message, ROLE_USER};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use crate::modules::find_module;
use crate::overlay::Overlay;
use crate::router::Router;
use crate::services::service_allow;

#[derive(Deserialize)]
struct InsmodRequest {
    path: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Deserialize)]
struct RmmodRequest {
    name: String,
}

#[derive(Deserialize)]
struct PanicRequest {
    reason: String,
    #[serde(default)]
    #[allow(dead_code)] // reserved
    flags: u32,
}

#[derive(Deserialize)]
struct TopicRequest {
    topic: String,
}

#[derive(Deserialize)]
struct ServiceRequest {
    service: String,
}

fn parse_body<T: DeserializeOwned>(msg: &Message) -> Result<T, Errno> {
    let value = msg.json().ok_or(Errno::Proto)?;
    serde_json::from_value(value.clone()).map_err(|_| Errno::Proto)
}

impl<O: Overlay> Router<O> {
    /// Requests under the internal service prefixes land here. Unmatched
    /// topics answer ENOSYS like any other unregistered service would.
    pub(crate) async fn dispatch_builtin(&mut self, msg: Message) {
        let Some(topic) = msg.topic().map(str::to_string) else {
            self.respond_err(&msg, Errno::Proto, None).await;
            return;
        };
        match topic.as_str() {
            "broker.insmod" => self.broker_insmod(&msg).await,
            "broker.rmmod" => self.broker_rmmod(&msg).await,
            "broker.lsmod" => self.broker_lsmod(&msg).await,
            "broker.panic" => self.broker_panic(&msg).await,
            "broker.disconnect" => self.broker_disconnect(&msg),
            "broker.sub" => self.broker_sub(&msg, true).await,
            "broker.unsub" => self.broker_sub(&msg, false).await,
            "service.add" => self.service_add(&msg).await,
            "service.remove" => self.service_remove(&msg).await,
            "event.pub" => self.event_pub(&msg).await,
            _ => self.respond_err(&msg, Errno::NoSys, None).await,
        }
    }

    fn check_owner(msg: &Message) -> Result<(), Errno> {
        if msg.cred.is_owner() {
            Ok(())
        } else {
            Err(Errno::Perm)
        }
    }

    fn check_user(msg: &Message) -> Result<(), Errno> {
        if msg.cred.is_owner() || msg.cred.has_role(ROLE_USER) {
            Ok(())
        } else {
            Err(Errno::Perm)
        }
    }

    /// Loads a module from a dso path. The service entry is registered
    /// under the module's implied name before the worker reports in.
    pub(crate) fn load_module(
        &mut self,
        path: &str,
        args: Vec<String>,
        request: Option<Message>,
    ) -> Result<(), Errno> {
        let loaded = self.loader.load(path)?;
        let name = loaded.name.clone();
        let uuid = self.host.insmod(loaded, path, args, request)?;
        let target = self.host.target(&uuid).ok_or(Errno::NoEnt)?;
        if let Err(errno) =
            self.services.add(name.clone(), Some(uuid.clone()), target)
        {
            // unwind the worker we just spawned
            self.host.rmmod(&name, None).ok();
            self.host.remove(&uuid);
            return Err(errno);
        }
        Ok(())
    }

    /// Resolves a module name against the configured search path and loads
    /// it.
    pub(crate) fn load_module_byname(
        &mut self,
        name: &str,
        args: Vec<String>,
    ) -> Result<(), Errno> {
        let path = find_module(&self.conf.module_path, name)
            .ok_or(Errno::NoEnt)?;
        let path = path.to_str().ok_or(Errno::Inval)?.to_string();
        self.load_module(&path, args, None)
    }

    /// Load a module, asynchronously: the response is deferred until the
    /// module reaches RUNNING or EXITED.
    async fn broker_insmod(&mut self, msg: &Message) {
        let result = Self::check_owner(msg)
            .and_then(|()| parse_body::<InsmodRequest>(msg))
            .and_then(|req| {
                self.load_module(&req.path, req.args, Some(msg.clone()))
            });
        if let Err(errno) = result {
            self.respond_err(msg, errno, None).await;
        }
    }

    /// Unload a module, asynchronously: all stacked requests are answered
    /// when the module exits.
    async fn broker_rmmod(&mut self, msg: &Message) {
        let result = Self::check_owner(msg)
            .and_then(|()| parse_body::<RmmodRequest>(msg))
            .and_then(|req| self.host.rmmod(&req.name, Some(msg.clone())));
        if let Err(errno) = result {
            self.respond_err(msg, errno, None).await;
        }
    }

    async fn broker_lsmod(&mut self, msg: &Message) {
        if let Err(errno) = Self::check_owner(msg) {
            self.respond_err(msg, errno, None).await;
            return;
        }
        let mods: Vec<serde_json::Value> = self
            .host
            .list()
            .into_iter()
            .map(|module| {
                serde_json::json!({
                    "name": module.name,
                    "path": module.path,
                    "state": module.status.as_str(),
                    "services": self.services.names_by_uuid(&module.uuid),
                })
            })
            .collect();
        self.respond_json(msg, serde_json::json!({ "mods": mods })).await;
    }

    async fn broker_panic(&mut self, msg: &Message) {
        if let Err(errno) = Self::check_owner(msg) {
            self.respond_err(msg, errno, None).await;
            return;
        }
        match parse_body::<PanicRequest>(msg) {
            Ok(req) => {
                error!("PANIC: {}", req.reason);
                std::process::exit(1);
            }
            Err(_) => error!("malformed broker.panic request"),
        }
    }

    /// The named peer went away; its subprocess management lives outside
    /// this core, so the disconnect is only accounted for here. Never
    /// answered.
    fn broker_disconnect(&mut self, msg: &Message) {
        if let Some(sender) = msg.route.first() {
            debug!("disconnect from {}", sender);
        }
    }

    /// The route-stack head names the subscribing module.
    async fn broker_sub(&mut self, msg: &Message, subscribe: bool) {
        let result = parse_body::<TopicRequest>(msg).and_then(|req| {
            let uuid = msg.route.first().ok_or(Errno::Proto)?.to_string();
            if subscribe {
                self.host.subscribe(&uuid, req.topic)
            } else {
                self.host.unsubscribe(&uuid, &req.topic)
            }
        });
        match result {
            Ok(()) => self.respond_ok(msg).await,
            Err(errno) => self.respond_err(msg, errno, None).await,
        }
    }

    /// Dynamic service registration on behalf of the sending module.
    async fn service_add(&mut self, msg: &Message) {
        let result = Self::check_user(msg)
            .and_then(|()| parse_body::<ServiceRequest>(msg))
            .and_then(|req| {
                service_allow(msg.cred, &req.service)?;
                let sender =
                    msg.route.first().ok_or(Errno::Proto)?.to_string();
                let target =
                    self.host.target(&sender).ok_or(Errno::NoEnt)?;
                self.services.add(req.service, Some(sender), target)
            });
        match result {
            Ok(()) => self.respond_ok(msg).await,
            Err(errno) => self.respond_err(msg, errno, None).await,
        }
    }

    /// Only the owning module may remove its dynamic registration.
    async fn service_remove(&mut self, msg: &Message) {
        let result = Self::check_user(msg)
            .and_then(|()| parse_body::<ServiceRequest>(msg))
            .and_then(|req| {
                service_allow(msg.cred, &req.service)?;
                let sender = msg.route.first().ok_or(Errno::Proto)?;
                let uuid = self.services.get_uuid(&req.service)?;
                if uuid != sender {
                    return Err(Errno::Inval);
                }
                self.services.remove(&req.service)
            });
        match result {
            Ok(()) => self.respond_ok(msg).await,
            Err(errno) => self.respond_err(msg, errno, None).await,
        }
    }

    /// Publish with sequence feedback; only registered on rank 0.
    async fn event_pub(&mut self, msg: &Message) {
        let result = Self::check_user(msg)
            .and_then(|()| self.publisher.publish_request(msg));
        match result {
            Ok(event) => {
                let seq = event.seq;
                self.distribute_event(event).await;
                self.respond_json(msg, serde_json::json!({ "seq": seq }))
                    .await;
            }
            Err(errno) => self.respond_err(msg, errno, None).await,
        }
    }
}
