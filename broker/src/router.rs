// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Top-level request/response/event routing.

use std::sync::Arc;

use broker_data::error::Errno;
use broker_data::message::{
    flags, Body, Credentials, Message, MessageType, ModuleStatus,
    NODEID_ANY, ROLE_NONE, USERID_UNKNOWN,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::conf::Params;
use crate::events::{EventState, Publisher};
use crate::handle::{Control, Handle};
use crate::modules::{ModuleHost, ModuleLoader, ModuleOutput};
use crate::overlay::{Direction, Overlay, OverlayMessage, Where};
use crate::services::{RouteTarget, ServiceSwitch};

pub(crate) const OFFLINE_ERRMSG: &str =
    "Upstream broker is offline. Try again later.";

/// Requeues switch-routed messages on the broker's internal handle.
struct HandleTarget {
    handle: Arc<Handle>,
}

impl RouteTarget for HandleTarget {
    fn deliver(&self, msg: &Message) -> Result<(), Errno> {
        self.handle.requeue(msg.clone())
    }
}

/// Built-in service prefixes registered at startup. An entry with a rank
/// exists only there; `event` living on rank 0 alone is what makes
/// `event.pub` resolve upward from every other rank.
const INTERNAL_SERVICES: &[(&str, Option<u32>)] = &[
    ("broker", None),
    ("service", None),
    ("log", None),
    ("attr", None),
    ("config", None),
    ("event", Some(0)),
];

pub struct Router<O: Overlay> {
    pub(crate) conf: Params,
    pub(crate) cred: Credentials,
    pub(crate) online: bool,
    pub(crate) overlay: Arc<O>,
    pub(crate) services: ServiceSwitch,
    pub(crate) host: ModuleHost,
    pub(crate) loader: Box<dyn ModuleLoader>,
    pub(crate) subscriptions: Vec<String>,
    pub(crate) publisher: Publisher,
    pub(crate) events: EventState,
    pub(crate) handle: Arc<Handle>,
    shutting_down: bool,
    shutdown_deadline: Instant,
}

impl<O: Overlay> Router<O> {
    pub(crate) fn new(
        conf: Params,
        overlay: Arc<O>,
        loader: Box<dyn ModuleLoader>,
        handle: Arc<Handle>,
        subscriptions: Vec<String>,
    ) -> Result<Self, Errno> {
        let cred = Credentials::owner(conf.userid);
        let mut router = Self {
            conf,
            cred,
            online: false,
            overlay,
            services: ServiceSwitch::new(),
            host: ModuleHost::new(cred),
            loader,
            subscriptions,
            publisher: Publisher::new(),
            events: EventState::new(),
            handle,
            shutting_down: false,
            shutdown_deadline: Instant::now(),
        };
        router.register_internal_services()?;
        Ok(router)
    }

    fn register_internal_services(&mut self) -> Result<(), Errno> {
        for (name, rank) in INTERNAL_SERVICES {
            if rank.is_some_and(|r| r != self.conf.rank) {
                continue;
            }
            self.services.add(
                *name,
                None,
                Box::new(HandleTarget {
                    handle: self.handle.clone(),
                }),
            )?;
        }
        Ok(())
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        if self.online != online {
            info!("broker {}", if online { "online" } else { "offline" });
        }
        self.online = online;
    }

    /// Drives the broker until shutdown completes. All routing decisions
    /// happen on this task; nothing here blocks outside the select.
    pub(crate) async fn run(mut self) -> anyhow::Result<()> {
        let control = self.handle.control_queue().clone();
        let requeue = self.handle.requeue_queue().clone();
        let egress = self.handle.egress_queue().clone();
        let module_out = self.host.outbound().clone();
        let overlay_in = self.overlay.inbound().clone();
        loop {
            tokio::select! {
                biased;
                ctl = control.recv() => match ctl {
                    Ok(ctl) => self.on_control(ctl),
                    Err(_) => break,
                },
                out = module_out.recv() => {
                    if let Ok(out) = out {
                        self.on_module_output(out).await;
                    }
                }
                inc = overlay_in.recv() => {
                    if let Ok(inc) = inc {
                        self.on_overlay_message(inc).await;
                    }
                }
                msg = requeue.recv() => match msg {
                    Ok(msg) => self.on_requeue(msg).await,
                    Err(_) => break,
                },
                msg = egress.recv() => match msg {
                    Ok(msg) => self.on_egress(msg).await,
                    Err(_) => break,
                },
                _ = tokio::time::sleep_until(self.shutdown_deadline),
                        if self.shutting_down => {
                    warn!("shutdown grace expired with modules loaded");
                    break;
                }
            }
            if self.shutting_down && self.host.is_empty() {
                break;
            }
        }
        info!("shutdown ...");
        Ok(())
    }

    fn on_control(&mut self, ctl: Control) {
        match ctl {
            Control::SetOnline(online) => self.set_online(online),
            Control::Subscribe(topic) => self.subscribe(topic),
            Control::Unsubscribe(topic) => self.unsubscribe(&topic),
            Control::Shutdown => {
                if !self.shutting_down {
                    info!("shutdown requested, stopping modules");
                    self.shutting_down = true;
                    self.shutdown_deadline =
                        Instant::now() + self.conf.shutdown_grace;
                    self.host.stop_all();
                }
            }
        }
    }

    /// Handles messages arriving from overlay peers.
    async fn on_overlay_message(&mut self, inc: OverlayMessage) {
        let OverlayMessage { msg, from } = inc;
        let mtype = msg.mtype;
        let topic = msg.topic.clone();
        let dropped = match mtype {
            MessageType::Request => {
                // errors answered in-band
                self.route_request(msg).await;
                None
            }
            MessageType::Response => self.route_response(msg).await.err(),
            MessageType::Event => {
                // An event from upstream has been published already and we
                // continue its distribution; otherwise it still needs to
                // reach the publisher.
                if from == Where::Upstream {
                    (!self.distribute_event(msg).await)
                        .then_some(Errno::Inval)
                } else {
                    self.route_event(msg).await.err()
                }
            }
            MessageType::Keepalive => None,
        };
        // A response that cannot be delivered because the sending module
        // unloaded mid-rpc is dropped without noise.
        if let Some(errno) = dropped {
            if mtype != MessageType::Response || errno != Errno::NoSys {
                warn!(
                    "DROP {} {} topic={}",
                    from.as_str(),
                    mtype.as_str(),
                    topic.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    /// Handles traffic on a module's channel.
    async fn on_module_output(&mut self, out: ModuleOutput) {
        let ModuleOutput { uuid, msg } = out;
        match msg.mtype {
            MessageType::Response => {
                if let Err(errno) = self.route_response(msg).await {
                    if errno != Errno::NoSys {
                        warn!("module response dropped: {}", errno);
                    }
                }
            }
            MessageType::Request => {
                let count = msg.route.count();
                // A request originated by the module itself has a route
                // count of 1; arm a disconnect for the service so unload
                // closes whatever the module left open.
                if count == 1 {
                    if let Some(service) = msg.service_name() {
                        self.host.arm_disconnect(&uuid, service);
                    }
                } else if count > 1 && !self.online {
                    // Forwarded on behalf of the module's own peers, e.g. a
                    // connector with connected clients. Politely rebuff
                    // until this broker is ready for them.
                    self.respond_err(&msg, Errno::Again, Some(OFFLINE_ERRMSG))
                        .await;
                    return;
                }
                self.route_request(msg).await;
            }
            MessageType::Event => {
                if let Err(errno) = self.route_event(msg).await {
                    warn!("module event dropped: {}", errno);
                }
            }
            MessageType::Keepalive => {
                self.on_module_keepalive(uuid, msg).await;
            }
        }
    }

    /// Materializes a module status change reported over its keepalive.
    async fn on_module_keepalive(&mut self, uuid: String, msg: Message) {
        let Some(status) = msg.module_status() else {
            warn!("malformed keepalive from module {}", uuid);
            return;
        };
        if status == ModuleStatus::Finalizing {
            // The module wants no more messages: mute it and echo the
            // keepalive so its drain loop can proceed.
            self.host.mute(&uuid);
            self.host.echo_keepalive(&uuid, msg.clone());
        }
        let errnum = msg.errnum;
        let Some(prev) = self.host.set_status(&uuid, status, errnum) else {
            return;
        };

        // INIT -> RUNNING: the module started normally; answer its insmod
        // now. Otherwise responses wait for EXITED when errnum is known.
        if prev == ModuleStatus::Init && status == ModuleStatus::Running {
            let pending = self
                .host
                .get_mut(&uuid)
                .and_then(|m| m.pending_insmod.take());
            if let Some(req) = pending {
                self.respond_ok(&req).await;
            }
        }

        if status == ModuleStatus::Exited {
            // Remove service routes, respond to insmod and rmmod
            // request(s), then remove the module (which joins the thread).
            self.services.remove_by_uuid(&uuid);
            let Some(module) = self.host.remove(&uuid) else {
                return;
            };
            if let Some(req) = &module.pending_insmod {
                match Errno::from_code(module.errnum) {
                    Some(errno) => self.respond_err(req, errno, None).await,
                    None if module.errnum != 0 => {
                        self.respond_err(req, Errno::Io, None).await
                    }
                    None => self.respond_ok(req).await,
                }
            }
            for req in &module.pending_rmmod {
                self.respond_ok(req).await;
            }
            // Close the rpcs the module left open: one synthetic
            // disconnect per service it talked to, sent as the module.
            for service in &module.services_used {
                let mut req = Message::new_request(
                    format!("{service}.disconnect"),
                    Body::Empty,
                );
                req.set_flag(flags::NORESPONSE);
                req.cred = self.cred;
                req.route.push(module.uuid.clone());
                self.route_request(req).await;
            }
        }
    }

    /// Dispatches messages requeued on the internal handle.
    async fn on_requeue(&mut self, msg: Message) {
        match msg.mtype {
            MessageType::Request => self.dispatch_builtin(msg).await,
            MessageType::Response => self.handle.resolve_response(msg),
            MessageType::Event => self.handle.deliver_event(msg),
            MessageType::Keepalive => {}
        }
    }

    /// Dispatches messages the embedder sent through the handle, stamping
    /// broker credentials where the sender left them unknown.
    async fn on_egress(&mut self, mut msg: Message) {
        if msg.cred.userid == USERID_UNKNOWN {
            msg.cred.userid = self.cred.userid;
        }
        if msg.cred.rolemask == ROLE_NONE {
            msg.cred.rolemask = self.cred.rolemask;
        }
        match msg.mtype {
            MessageType::Request => self.route_request(msg).await,
            MessageType::Response => {
                if let Err(errno) = self.route_response(msg).await {
                    if errno != Errno::NoSys {
                        warn!("handle response dropped: {}", errno);
                    }
                }
            }
            MessageType::Event => {
                if let Err(errno) = self.route_event(msg).await {
                    warn!("handle event dropped: {}", errno);
                }
            }
            MessageType::Keepalive => {
                warn!("dropping keepalive sent on internal handle")
            }
        }
    }

    /// Routes a request, answering the originator in-band on failure. An
    /// unmatched service gets a useful error string along with ENOSYS.
    pub(crate) async fn route_request(&mut self, msg: Message) {
        if let Err(errno) = self.route_request_internal(&msg).await {
            let errstr = match errno {
                Errno::NoSys => msg
                    .topic()
                    .map(|t| format!("No service matching {t} is registered")),
                _ => None,
            };
            self.respond_err(&msg, errno, errstr.as_deref()).await;
        }
    }

    /// Decides a request's next hop.
    async fn route_request_internal(
        &mut self,
        msg: &Message,
    ) -> Result<(), Errno> {
        let rank = self.conf.rank;
        let upstream = msg.has_flag(flags::UPSTREAM);

        // Route up the tree if the destination is upstream of this broker.
        if upstream && msg.nodeid == rank {
            self.overlay.send(msg.clone(), Direction::Up).await
        }
        // Deliver to a local service if the destination *could* be this
        // broker. If there is no such service locally, route up.
        else if (upstream && msg.nodeid != rank) || msg.nodeid == NODEID_ANY
        {
            match self.services.send(msg) {
                Ok(()) => Ok(()),
                Err(Errno::NoSys) => {
                    match self.overlay.send(msg.clone(), Direction::Up).await
                    {
                        Ok(()) => Ok(()),
                        // the root answers for the whole instance
                        Err(Errno::HostUnreach) => Err(Errno::NoSys),
                        Err(errno) => Err(errno),
                    }
                }
                Err(errno) => Err(errno),
            }
        }
        // Deliver locally if this broker is the addressed rank.
        else if msg.nodeid == rank {
            self.services.send(msg)
        }
        // Send up or down the tree as addressed.
        else {
            self.overlay.send(msg.clone(), Direction::Any).await
        }
    }

    /// Routes a response by its route stack. No next hop means routing is
    /// complete to a broker-resident service; a peer hop goes back on the
    /// overlay; anything else names a module.
    pub(crate) async fn route_response(
        &mut self,
        msg: Message,
    ) -> Result<(), Errno> {
        let Some(uuid) = msg.route.last().map(str::to_string) else {
            return self.handle.requeue(msg);
        };
        if self.overlay.is_parent(&uuid) {
            self.overlay.send(msg, Direction::Up).await
        } else if self.overlay.is_child(&uuid) {
            self.overlay.send(msg, Direction::Down).await
        } else {
            self.host.send_response(msg)
        }
    }

    /// Events flow up the tree until rank 0 sequences and distributes
    /// them.
    pub(crate) async fn route_event(
        &mut self,
        msg: Message,
    ) -> Result<(), Errno> {
        if self.conf.rank > 0 {
            self.overlay.send(msg, Direction::Up).await
        } else {
            let event = self.publisher.publish(&msg)?;
            self.distribute_event(event).await;
            Ok(())
        }
    }

    /// Distributes a published event at this rank: forward to children,
    /// requeue for broker-resident subscribers (at most once), multicast
    /// to subscribed modules. Returns false if the event was dropped.
    pub(crate) async fn distribute_event(&mut self, msg: Message) -> bool {
        let Some(topic) = msg.topic().map(str::to_string) else {
            warn!("dropping malformed event");
            return false;
        };
        if msg.seq == 0 {
            warn!("dropping malformed event {}", topic);
            return false;
        }
        if !self.events.observe(msg.seq) {
            debug!("dropping duplicate event {}", msg.seq);
            return false;
        }

        if let Err(errno) =
            self.overlay.send(msg.clone(), Direction::Down).await
        {
            warn!("event fan-out failed: {}", errno);
        }

        if self
            .subscriptions
            .iter()
            .any(|prefix| topic.starts_with(prefix.as_str()))
        {
            if let Err(errno) = self.handle.requeue(msg.clone()) {
                warn!("event requeue failed: {}", errno);
            }
        }

        self.host.event_mcast(&msg);
        true
    }

    pub(crate) fn subscribe(&mut self, topic: impl Into<String>) {
        self.subscriptions.push(topic.into());
    }

    pub(crate) fn unsubscribe(&mut self, topic: &str) {
        if let Some(pos) =
            self.subscriptions.iter().position(|s| s == topic)
        {
            self.subscriptions.remove(pos);
        }
    }

    /// Responds success with an empty payload.
    pub(crate) async fn respond_ok(&mut self, req: &Message) {
        if let Some(resp) = Message::respond(req, Body::Empty) {
            self.send_response_logged(resp).await;
        }
    }

    pub(crate) async fn respond_json(
        &mut self,
        req: &Message,
        value: serde_json::Value,
    ) {
        if let Some(resp) = Message::respond(req, Body::Json(value)) {
            self.send_response_logged(resp).await;
        }
    }

    pub(crate) async fn respond_err(
        &mut self,
        req: &Message,
        errno: Errno,
        errstr: Option<&str>,
    ) {
        if let Some(resp) = Message::respond_error(req, errno, errstr) {
            self.send_response_logged(resp).await;
        }
    }

    /// Routing a response may fail, but failures never produce another
    /// response; ENOSYS means the requester unloaded and stays quiet.
    async fn send_response_logged(&mut self, resp: Message) {
        if let Err(errno) = self.route_response(resp).await {
            if errno != Errno::NoSys {
                warn!("response dropped: {}", errno);
            }
        }
    }
}
