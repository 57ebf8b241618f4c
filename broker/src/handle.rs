// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The broker's in-process handle. Built-in services "receive" messages
//! when routing logic requeues them here; the embedder uses the same
//! handle to originate requests and to read delivered events.

use std::collections::HashMap;
use std::sync::Mutex;

use broker_data::error::Errno;
use broker_data::message::{
    flags, AsyncQueue, Message, MessageType, MATCHTAG_NONE,
};
use broker_data::tagpool::TagPool;
use tokio::sync::oneshot;
use tracing::warn;

/// Out-of-band inputs to the router from the embedding broker state
/// machine.
#[derive(Debug, Clone)]
pub enum Control {
    SetOnline(bool),
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

struct RpcState {
    tags: TagPool,
    pending: HashMap<u32, oneshot::Sender<Message>>,
}

pub struct Handle {
    /// Messages routed to broker-resident services.
    requeue: AsyncQueue<Message>,
    /// Messages the embedder hands to the router for dispatch.
    egress: AsyncQueue<Message>,
    control: AsyncQueue<Control>,
    /// Events matching the broker's own subscriptions.
    events: AsyncQueue<Message>,
    rpc: Mutex<RpcState>,
}

impl Handle {
    pub(crate) fn new() -> Self {
        Self {
            requeue: AsyncQueue::unbounded("handle_requeue"),
            egress: AsyncQueue::unbounded("handle_egress"),
            control: AsyncQueue::unbounded("handle_control"),
            events: AsyncQueue::unbounded("handle_events"),
            rpc: Mutex::new(RpcState {
                tags: TagPool::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Sends a request and awaits its terminal response. The matchtag is
    /// allocated here and freed when the response arrives.
    pub async fn rpc(&self, mut req: Message) -> Result<Message, Errno> {
        if req.mtype != MessageType::Request
            || req.has_flag(flags::NORESPONSE)
        {
            return Err(Errno::Inval);
        }
        let (tx, rx) = oneshot::channel();
        let tag = {
            let mut state = self.rpc.lock().unwrap();
            let tag = state.tags.alloc();
            if tag == MATCHTAG_NONE {
                return Err(Errno::Busy);
            }
            state.pending.insert(tag, tx);
            tag
        };
        req.matchtag = tag;
        if self.egress.send(req).await.is_err() {
            let mut state = self.rpc.lock().unwrap();
            state.pending.remove(&tag);
            state.tags.free(tag);
            return Err(Errno::Io);
        }
        match rx.await {
            Ok(resp) => {
                self.rpc.lock().unwrap().tags.free(tag);
                Ok(resp)
            }
            Err(_) => Err(Errno::Io),
        }
    }

    /// Hands a message to the router without tracking a response.
    pub async fn send(&self, msg: Message) -> Result<(), Errno> {
        self.egress.send(msg).await.map_err(|_| Errno::Io)
    }

    /// Next event delivered to the broker's own subscriptions.
    pub async fn next_event(&self) -> Result<Message, Errno> {
        self.events.recv().await.map_err(|_| Errno::Io)
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.control.try_send(Control::SetOnline(online));
    }

    /// Adds a prefix to the broker's own subscription set; matching events
    /// show up on `next_event`.
    pub fn subscribe(&self, topic: impl Into<String>) {
        let _ = self.control.try_send(Control::Subscribe(topic.into()));
    }

    /// Removes one matching prefix; a no-op if it was never subscribed.
    pub fn unsubscribe(&self, topic: impl Into<String>) {
        let _ = self.control.try_send(Control::Unsubscribe(topic.into()));
    }

    pub fn shutdown(&self) {
        let _ = self.control.try_send(Control::Shutdown);
    }

    /// Matchtags currently tied to outstanding requests.
    pub fn matchtags_outstanding(&self) -> u32 {
        self.rpc.lock().unwrap().tags.outstanding()
    }

    pub(crate) fn requeue(&self, msg: Message) -> Result<(), Errno> {
        self.requeue.try_send(msg).map_err(|_| Errno::NoMem)
    }

    pub(crate) fn requeue_queue(&self) -> &AsyncQueue<Message> {
        &self.requeue
    }

    pub(crate) fn egress_queue(&self) -> &AsyncQueue<Message> {
        &self.egress
    }

    pub(crate) fn control_queue(&self) -> &AsyncQueue<Control> {
        &self.control
    }

    /// Completes the pending rpc a response belongs to. Unmatched
    /// responses are logged and dropped.
    pub(crate) fn resolve_response(&self, msg: Message) {
        let tag = msg.matchtag;
        let sender = self.rpc.lock().unwrap().pending.remove(&tag);
        match sender {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    // requester gave up; reclaim the tag on its behalf
                    self.rpc.lock().unwrap().tags.free(tag);
                }
            }
            None => {
                warn!(
                    "dropping unmatched response (tag {}, topic {:?})",
                    tag,
                    msg.topic()
                );
            }
        }
    }

    pub(crate) fn deliver_event(&self, msg: Message) {
        if self.events.try_send(msg).is_err() {
            warn!("event overflow on internal handle");
        }
    }
}
