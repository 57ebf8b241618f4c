// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Event publishing service on rank 0.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use broker_data::error::Errno;
use broker_data::message::{flags, Body, Message, MessageType};
use serde::Deserialize;

/// Body of an `event.pub` request. The payload, if any, is base64.
#[derive(Deserialize)]
struct PubRequest {
    topic: String,
    flags: u8,
    payload: Option<String>,
}

/// Rank-0 sequencer. Assigns each published event the next number of a
/// gap-free, monotonically increasing sequence starting at 1. An event is
/// fully constructed before a number is taken, so a malformed request
/// cannot burn one; a downstream send failure after assignment does not
/// retract the event.
#[derive(Default)]
pub struct Publisher {
    seq: u32,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Sequences an event submitted in-band (a module or downstream peer
    /// sent an unsequenced event message).
    pub fn publish(&mut self, msg: &Message) -> Result<Message, Errno> {
        if msg.mtype != MessageType::Event || msg.topic().is_none() {
            return Err(Errno::Proto);
        }
        let mut event = msg.clone();
        self.seq += 1;
        event.seq = self.seq;
        Ok(event)
    }

    /// Builds and sequences an event from an `event.pub` request. Only the
    /// PRIVATE flag is legal; the event inherits the request credentials.
    pub fn publish_request(&mut self, req: &Message) -> Result<Message, Errno> {
        let body = req.json().ok_or(Errno::Proto)?;
        let pub_req: PubRequest =
            serde_json::from_value(body.clone()).map_err(|_| Errno::Proto)?;
        if pub_req.flags & !flags::PRIVATE != 0 {
            return Err(Errno::Proto);
        }
        let body = match &pub_req.payload {
            Some(b64) => Body::Raw(
                BASE64.decode(b64).map_err(|_| Errno::Proto)?,
            ),
            None => Body::Empty,
        };
        let mut event = Message::new_event(pub_req.topic, body);
        event.flags = pub_req.flags;
        event.cred = req.cred;
        self.seq += 1;
        event.seq = self.seq;
        Ok(event)
    }
}
