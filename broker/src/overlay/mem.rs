// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::RwLock;

use async_trait::async_trait;
use broker_data::error::Errno;
use broker_data::message::{AsyncQueue, Message, MessageType};
use tracing::warn;
use uuid::Uuid;

use super::{child_toward, parent_of, Direction, Overlay, OverlayMessage, Where};

const INBOUND_LABEL: &str = "overlay_inbound";

#[derive(Clone)]
struct Link {
    rank: u32,
    uuid: String,
    queue: AsyncQueue<OverlayMessage>,
}

#[derive(Default)]
struct Links {
    parent: Option<Link>,
    children: Vec<Link>,
}

/// In-process overlay: brokers of one instance exchange messages over
/// queues instead of sockets. Sending a request pushes the sender identity
/// onto the route stack; sending a response pops the next hop off it, the
/// way a router socket consumes its identity frame.
pub struct MemOverlay {
    rank: u32,
    fanout: u32,
    uuid: String,
    inbound: AsyncQueue<OverlayMessage>,
    links: RwLock<Links>,
}

impl MemOverlay {
    pub fn new(rank: u32, fanout: u32) -> Self {
        Self {
            rank,
            fanout,
            uuid: Uuid::new_v4().simple().to_string(),
            inbound: AsyncQueue::unbounded(INBOUND_LABEL),
            links: RwLock::new(Links::default()),
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Links `child` under `parent`. Ranks must agree with the tree shape.
    pub fn link(parent: &MemOverlay, child: &MemOverlay) {
        debug_assert_eq!(
            parent_of(child.rank, parent.fanout),
            Some(parent.rank),
            "link does not follow tree shape"
        );
        parent.links.write().unwrap().children.push(Link {
            rank: child.rank,
            uuid: child.uuid.clone(),
            queue: child.inbound.clone(),
        });
        child.links.write().unwrap().parent = Some(Link {
            rank: parent.rank,
            uuid: parent.uuid.clone(),
            queue: parent.inbound.clone(),
        });
    }

    /// Builds a fully-linked instance of `size` brokers.
    pub fn instance(size: u32, fanout: u32) -> Vec<Self> {
        let overlays: Vec<Self> =
            (0..size).map(|rank| Self::new(rank, fanout)).collect();
        for rank in 1..size as usize {
            let parent = parent_of(rank as u32, fanout).unwrap() as usize;
            Self::link(&overlays[parent], &overlays[rank]);
        }
        overlays
    }

    fn deliver(link: &Link, msg: Message, from: Where) -> Result<(), Errno> {
        link.queue
            .try_send(OverlayMessage { msg, from })
            .map_err(|_| Errno::HostUnreach)
    }

    fn send_up(&self, msg: Message) -> Result<(), Errno> {
        let links = self.links.read().unwrap();
        let parent = links.parent.as_ref().ok_or(Errno::HostUnreach)?;
        // the receiver sees this message coming from its downstream side
        Self::deliver(parent, msg, Where::Downstream)
    }

    fn send_down_to_rank(&self, msg: Message, rank: u32) -> Result<(), Errno> {
        let links = self.links.read().unwrap();
        let child = links
            .children
            .iter()
            .find(|link| link.rank == rank)
            .ok_or(Errno::HostUnreach)?;
        Self::deliver(child, msg, Where::Upstream)
    }

    fn send_down_to_uuid(&self, msg: Message, uuid: &str) -> Result<(), Errno> {
        let links = self.links.read().unwrap();
        let child = links
            .children
            .iter()
            .find(|link| link.uuid == uuid)
            .ok_or(Errno::HostUnreach)?;
        Self::deliver(child, msg, Where::Upstream)
    }

    fn send_request(
        &self,
        mut msg: Message,
        dir: Direction,
    ) -> Result<(), Errno> {
        msg.route.push(self.uuid.clone());
        match dir {
            Direction::Up => self.send_up(msg),
            Direction::Down => {
                let child = child_toward(self.rank, self.fanout, msg.nodeid)
                    .ok_or(Errno::HostUnreach)?;
                self.send_down_to_rank(msg, child)
            }
            Direction::Any => {
                match child_toward(self.rank, self.fanout, msg.nodeid) {
                    Some(child) => self.send_down_to_rank(msg, child),
                    None => self.send_up(msg),
                }
            }
        }
    }

    fn send_response(
        &self,
        mut msg: Message,
        dir: Direction,
    ) -> Result<(), Errno> {
        let hop = msg.route.pop().ok_or(Errno::Inval)?;
        match dir {
            Direction::Up => self.send_up(msg),
            Direction::Down => self.send_down_to_uuid(msg, &hop),
            Direction::Any => {
                if self.is_parent(&hop) {
                    self.send_up(msg)
                } else {
                    self.send_down_to_uuid(msg, &hop)
                }
            }
        }
    }

    fn send_event(&self, msg: Message, dir: Direction) -> Result<(), Errno> {
        match dir {
            Direction::Up => self.send_up(msg),
            Direction::Down => {
                // fan out to every child subtree
                let links = self.links.read().unwrap();
                for child in &links.children {
                    if let Err(e) =
                        Self::deliver(child, msg.clone(), Where::Upstream)
                    {
                        warn!(
                            "event fan-out to child {} failed: {}",
                            child.rank, e
                        );
                    }
                }
                Ok(())
            }
            Direction::Any => Err(Errno::Inval),
        }
    }
}

#[async_trait]
impl Overlay for MemOverlay {
    async fn send(&self, msg: Message, dir: Direction) -> Result<(), Errno> {
        match msg.mtype {
            MessageType::Request => self.send_request(msg, dir),
            MessageType::Response => self.send_response(msg, dir),
            MessageType::Event => self.send_event(msg, dir),
            MessageType::Keepalive => Err(Errno::Inval),
        }
    }

    fn is_parent(&self, uuid: &str) -> bool {
        self.links
            .read()
            .unwrap()
            .parent
            .as_ref()
            .is_some_and(|link| link.uuid == uuid)
    }

    fn is_child(&self, uuid: &str) -> bool {
        self.links
            .read()
            .unwrap()
            .children
            .iter()
            .any(|link| link.uuid == uuid)
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn inbound(&self) -> &AsyncQueue<OverlayMessage> {
        &self.inbound
    }
}
