// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Module worker thread: the broker side spawns one per loaded module and
//! speaks a small keepalive protocol with it over the module's channel
//! pair.

use std::cell::RefCell;
use std::collections::VecDeque;

use broker_data::error::Errno;
use broker_data::message::{
    AsyncQueue, Body, Credentials, Message, MessageType, ModuleStatus,
    MATCHTAG_NONE, ROLE_NONE, USERID_UNKNOWN,
};
use broker_data::tagpool::TagPool;
use tracing::{debug, error};

/// A message leaving a module worker, tagged with its origin.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub uuid: String,
    pub msg: Message,
}

/// Entry point of a loadable module. `run` executes on the module's worker
/// thread; returning ends the module. A typed [`Errno`] in the error chain
/// becomes the module's exit errnum, anything else maps to EIO.
pub trait ModuleMain: Send + 'static {
    fn run(&mut self, ctx: &ModuleContext) -> anyhow::Result<()>;
}

impl<F> ModuleMain for F
where
    F: FnMut(&ModuleContext) -> anyhow::Result<()> + Send + 'static,
{
    fn run(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// The module's side of the channel pair, plus its identity and arguments.
pub struct ModuleContext {
    name: String,
    uuid: String,
    args: Vec<String>,
    /// Credentials stamped on outbound messages the module leaves blank.
    cred: Credentials,
    inbound: AsyncQueue<Message>,
    outbound: AsyncQueue<ModuleOutput>,
    tags: RefCell<TagPool>,
    /// Messages set aside while waiting on an rpc response; replayed by
    /// `recv` in arrival order.
    backlog: RefCell<VecDeque<Message>>,
}

impl ModuleContext {
    pub(crate) fn new(
        name: String,
        uuid: String,
        args: Vec<String>,
        cred: Credentials,
        inbound: AsyncQueue<Message>,
        outbound: AsyncQueue<ModuleOutput>,
    ) -> Self {
        Self {
            name,
            uuid,
            args,
            cred,
            inbound,
            outbound,
            tags: RefCell::new(TagPool::new()),
            backlog: RefCell::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Reports readiness to the broker, transitioning the module to
    /// RUNNING and releasing its pending insmod response.
    pub fn ready(&self) {
        self.send_keepalive(0, ModuleStatus::Running);
    }

    /// Next inbound message. None once the broker asks the module to
    /// finalize or the channel closes; the module should then return from
    /// its main loop.
    pub fn recv(&self) -> Option<Message> {
        if let Some(msg) = self.backlog.borrow_mut().pop_front() {
            return Some(msg);
        }
        match self.inbound.recv_blocking() {
            Ok(msg) if msg.mtype == MessageType::Keepalive => None,
            Ok(msg) => Some(msg),
            Err(_) => None,
        }
    }

    /// Sends a message toward the broker. Module-originated requests carry
    /// this module's uuid as route origin; credentials the module left
    /// blank become the module's own.
    pub fn send(&self, mut msg: Message) -> Result<(), Errno> {
        if msg.mtype == MessageType::Request {
            msg.route.push(self.uuid.clone());
        }
        if msg.cred.userid == USERID_UNKNOWN {
            msg.cred.userid = self.cred.userid;
        }
        if msg.cred.rolemask == ROLE_NONE {
            msg.cred.rolemask = self.cred.rolemask;
        }
        self.outbound
            .send_blocking(ModuleOutput {
                uuid: self.uuid.clone(),
                msg,
            })
            .map_err(|_| Errno::Io)
    }

    /// Responds to `req`. A NORESPONSE request is silently satisfied.
    pub fn respond(&self, req: &Message, body: Body) -> Result<(), Errno> {
        match Message::respond(req, body) {
            Some(resp) => self.send(resp),
            None => Ok(()),
        }
    }

    pub fn respond_error(
        &self,
        req: &Message,
        errno: Errno,
        errstr: Option<&str>,
    ) -> Result<(), Errno> {
        match Message::respond_error(req, errno, errstr) {
            Some(resp) => self.send(resp),
            None => Ok(()),
        }
    }

    /// Sends a request and blocks for its terminal response, setting other
    /// inbound traffic aside for later `recv` calls.
    pub fn rpc(&self, mut req: Message) -> Result<Message, Errno> {
        let tag = self.tags.borrow_mut().alloc();
        if tag == MATCHTAG_NONE {
            return Err(Errno::Busy);
        }
        req.matchtag = tag;
        self.send(req)?;
        loop {
            let msg = self.inbound.recv_blocking().map_err(|_| Errno::Io)?;
            match msg.mtype {
                MessageType::Response if msg.matchtag == tag => {
                    self.tags.borrow_mut().free(tag);
                    return Ok(msg);
                }
                // broker asked us to finalize mid-rpc
                MessageType::Keepalive => return Err(Errno::Io),
                _ => self.backlog.borrow_mut().push_back(msg),
            }
        }
    }

    fn send_keepalive(&self, errnum: u32, status: ModuleStatus) {
        let msg = Message::new_keepalive(errnum, status);
        let _ = self.outbound.send_blocking(ModuleOutput {
            uuid: self.uuid.clone(),
            msg,
        });
    }

    /// Blocks until the broker echoes our finalizing keepalive, discarding
    /// whatever else is still queued.
    fn wait_finalize_ack(&self) {
        loop {
            match self.inbound.recv_blocking() {
                Ok(msg) if msg.mtype == MessageType::Keepalive => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}

/// Worker thread body: run the module, then walk the finalize handshake so
/// the broker stops delivering before the channel is torn down.
pub(crate) fn run_module(
    mut main: Box<dyn ModuleMain>,
    ctx: ModuleContext,
    library: Option<libloading::Library>,
) {
    let errnum = match main.run(&ctx) {
        Ok(()) => 0,
        Err(err) => {
            let errnum = err
                .downcast_ref::<Errno>()
                .map(|e| e.code())
                .unwrap_or_else(|| Errno::Io.code());
            error!("module {} failed: {:#}", ctx.name(), err);
            errnum
        }
    };

    debug!("module {} finalizing", ctx.name());
    ctx.send_keepalive(0, ModuleStatus::Finalizing);
    ctx.wait_finalize_ack();
    ctx.send_keepalive(errnum, ModuleStatus::Exited);

    // the dso must outlive the module main
    drop(main);
    drop(library);
}
