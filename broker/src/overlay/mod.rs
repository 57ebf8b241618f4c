// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Overlay adapter: directional send over the tree-based overlay network
//! and peer membership tests. The transport itself is a collaborator; the
//! crate ships an in-process implementation for tests and single-host
//! instances.

mod mem;

pub use mem::MemOverlay;

use async_trait::async_trait;
use broker_data::error::Errno;
use broker_data::message::{AsyncQueue, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    /// Decide by nodeid.
    Any,
}

/// Which side of the tree a received message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Where {
    Upstream,
    Downstream,
}

impl Where {
    pub fn as_str(&self) -> &'static str {
        match self {
            Where::Upstream => "upstream",
            Where::Downstream => "downstream",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverlayMessage {
    pub msg: Message,
    pub from: Where,
}

#[async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// Sends a message along the tree. `EHOSTUNREACH` if the requested
    /// direction is impossible (e.g. Up from rank 0).
    async fn send(&self, msg: Message, dir: Direction) -> Result<(), Errno>;

    fn is_parent(&self, uuid: &str) -> bool;

    fn is_child(&self, uuid: &str) -> bool;

    /// This broker's overlay identity.
    fn uuid(&self) -> &str;

    /// Receive side: messages from both directions, in arrival order.
    fn inbound(&self) -> &AsyncQueue<OverlayMessage>;
}

/// Parent of `rank` in a k-ary tree, None for the root.
pub fn parent_of(rank: u32, fanout: u32) -> Option<u32> {
    (rank > 0).then(|| (rank - 1) / fanout)
}

/// The direct child of `rank` whose subtree contains `target`, if any.
pub fn child_toward(rank: u32, fanout: u32, target: u32) -> Option<u32> {
    let mut r = target;
    while r > rank {
        match parent_of(r, fanout) {
            Some(p) if p == rank => return Some(r),
            Some(p) => r = p,
            None => return None,
        }
    }
    None
}
