// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::{self, Read, Write};

use async_channel::TrySendError;
use smallvec::SmallVec;

use crate::error::Errno;

/// Request destination meaning "any broker that can service the topic".
pub const NODEID_ANY: u32 = u32::MAX;

/// Reserved matchtag for messages that expect no response.
pub const MATCHTAG_NONE: u32 = 0;

/// Credential value for a message whose sender has not been authenticated.
pub const USERID_UNKNOWN: u32 = u32::MAX;

pub const ROLE_NONE: u32 = 0;
pub const ROLE_OWNER: u32 = 1;
pub const ROLE_USER: u32 = 2;

/// Message flag bits.
pub mod flags {
    /// The request may receive multiple non-terminal responses.
    pub const STREAMING: u8 = 0x01;
    /// The event is only delivered to owner-credentialed subscribers.
    pub const PRIVATE: u8 = 0x02;
    /// The request must be serviced by an ancestor of the addressed rank.
    pub const UPSTREAM: u8 = 0x04;
    /// No response may be generated for this request.
    pub const NORESPONSE: u8 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x01,
    Response = 0x02,
    Event = 0x04,
    Keepalive = 0x08,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(MessageType::Request),
            0x02 => Some(MessageType::Response),
            0x04 => Some(MessageType::Event),
            0x08 => Some(MessageType::Keepalive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Keepalive => "keepalive",
        }
    }
}

/// Module run state as reported over keepalive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ModuleStatus {
    Init = 0,
    Running = 1,
    Finalizing = 2,
    Exited = 3,
}

impl ModuleStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ModuleStatus::Init),
            1 => Some(ModuleStatus::Running),
            2 => Some(ModuleStatus::Finalizing),
            3 => Some(ModuleStatus::Exited),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Init => "init",
            ModuleStatus::Running => "running",
            ModuleStatus::Finalizing => "finalizing",
            ModuleStatus::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub userid: u32,
    pub rolemask: u32,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            userid: USERID_UNKNOWN,
            rolemask: ROLE_NONE,
        }
    }
}

impl Credentials {
    pub fn new(userid: u32, rolemask: u32) -> Self {
        Self { userid, rolemask }
    }

    pub fn owner(userid: u32) -> Self {
        Self {
            userid,
            rolemask: ROLE_OWNER | ROLE_USER,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.rolemask & ROLE_OWNER != 0
    }

    pub fn has_role(&self, role: u32) -> bool {
        self.rolemask & role != 0
    }
}

/// Identities pushed onto a message as it traverses brokers, most recent
/// last. A response pops the tail to find its next hop on the reverse path;
/// the head identifies the original sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStack(SmallVec<[String; 2]>);

impl RouteStack {
    pub fn push(&mut self, uuid: impl Into<String>) {
        self.0.push(uuid.into());
    }

    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    /// The original sender.
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The immediate next hop on the reverse path.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Message payload. Wire frames carry a structured (JSON) and a raw slot;
/// in memory a message holds at most one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

/// Message definition.
///
/// Messages are value types: a component that needs to mutate one it does
/// not own must clone it first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub topic: Option<String>,
    pub flags: u8,
    pub cred: Credentials,

    /// Target rank (requests only).
    pub nodeid: u32,
    /// Ties a request to its response on the originating handle.
    pub matchtag: u32,
    /// Error number (responses; keepalive exit errors).
    pub errnum: u32,
    /// Publication sequence number (events only).
    pub seq: u32,
    /// Module run state (keepalives only).
    pub status: u32,

    pub body: Body,
    pub route: RouteStack,
}

impl Message {
    fn new(mtype: MessageType) -> Self {
        Self {
            mtype,
            topic: None,
            flags: 0,
            cred: Credentials::default(),
            nodeid: NODEID_ANY,
            matchtag: MATCHTAG_NONE,
            errnum: 0,
            seq: 0,
            status: 0,
            body: Body::Empty,
            route: RouteStack::default(),
        }
    }

    pub fn new_request(topic: impl Into<String>, body: Body) -> Self {
        let mut msg = Self::new(MessageType::Request);
        msg.topic = Some(topic.into());
        msg.body = body;
        msg
    }

    pub fn new_event(topic: impl Into<String>, body: Body) -> Self {
        let mut msg = Self::new(MessageType::Event);
        msg.topic = Some(topic.into());
        msg.body = body;
        msg
    }

    pub fn new_keepalive(errnum: u32, status: ModuleStatus) -> Self {
        let mut msg = Self::new(MessageType::Keepalive);
        msg.errnum = errnum;
        msg.status = status as u32;
        msg
    }

    /// Builds the response mirror of `req`: same topic, matchtag,
    /// credentials and route stack. Returns None if the request forbids
    /// responses.
    pub fn respond(req: &Message, body: Body) -> Option<Message> {
        if req.mtype != MessageType::Request
            || req.has_flag(flags::NORESPONSE)
        {
            return None;
        }
        let mut msg = Self::new(MessageType::Response);
        msg.topic = req.topic.clone();
        msg.matchtag = req.matchtag;
        msg.cred = req.cred;
        msg.route = req.route.clone();
        msg.flags = req.flags & flags::STREAMING;
        msg.body = body;
        Some(msg)
    }

    /// Builds an error response mirror of `req`. The error string, if any,
    /// rides in the raw payload slot.
    pub fn respond_error(
        req: &Message,
        errno: Errno,
        errstr: Option<&str>,
    ) -> Option<Message> {
        let body = match errstr {
            Some(s) => Body::Raw(s.as_bytes().to_vec()),
            None => Body::Empty,
        };
        let mut msg = Self::respond(req, body)?;
        msg.errnum = errno.code();
        Some(msg)
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// The leading dotted component of the topic, which names the service
    /// that will handle the message.
    pub fn service_name(&self) -> Option<&str> {
        let topic = self.topic()?;
        Some(topic.split('.').next().unwrap_or(topic))
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    /// The error string of an error response, if one was attached.
    pub fn errstr(&self) -> Option<&str> {
        match &self.body {
            Body::Raw(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.body {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn module_status(&self) -> Option<ModuleStatus> {
        if self.mtype != MessageType::Keepalive {
            return None;
        }
        ModuleStatus::from_u32(self.status)
    }
}

const BODY_EMPTY: u8 = 0;
const BODY_JSON: u8 = 1;
const BODY_RAW: u8 = 2;

/// Length-prefixed codec field.
fn write_frame<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    let len = buf.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(buf)
}

fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; read_u32_le(r)? as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string_frame<R: Read>(r: &mut R) -> io::Result<String> {
    String::from_utf8(read_frame(r)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    Ok(u32::from_le_bytes(word))
}

impl Message {
    /// Encodes in frame order: route uuids, route delimiter, topic,
    /// payload, proto header. The proto header's two auxiliary words are
    /// type-dependent: nodeid/matchtag (request), errnum/matchtag
    /// (response), seq (event), errnum/status (keepalive).
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for uuid in self.route.iter() {
            write_frame(w, uuid.as_bytes())?;
        }
        write_frame(w, &[])?;

        let topic = self.topic.as_deref().unwrap_or("");
        write_frame(w, topic.as_bytes())?;

        match &self.body {
            Body::Empty => w.write_all(&[BODY_EMPTY])?,
            Body::Json(v) => {
                w.write_all(&[BODY_JSON])?;
                let buf = serde_json::to_vec(v).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, e)
                })?;
                write_frame(w, &buf)?;
            }
            Body::Raw(bytes) => {
                w.write_all(&[BODY_RAW])?;
                write_frame(w, bytes)?;
            }
        }

        w.write_all(&[self.mtype as u8, self.flags])?;
        w.write_all(&self.cred.userid.to_le_bytes())?;
        w.write_all(&self.cred.rolemask.to_le_bytes())?;
        let (aux1, aux2) = match self.mtype {
            MessageType::Request => (self.nodeid, self.matchtag),
            MessageType::Response => (self.errnum, self.matchtag),
            MessageType::Event => (self.seq, 0),
            MessageType::Keepalive => (self.errnum, self.status),
        };
        w.write_all(&aux1.to_le_bytes())?;
        w.write_all(&aux2.to_le_bytes())?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut route = RouteStack::default();
        loop {
            let frame = read_frame(r)?;
            if frame.is_empty() {
                break;
            }
            let uuid = String::from_utf8(frame).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, e)
            })?;
            route.push(uuid);
        }

        let topic = match read_string_frame(r)? {
            topic if topic.is_empty() => None,
            topic => Some(topic),
        };

        let body = match read_u8(r)? {
            BODY_EMPTY => Body::Empty,
            BODY_JSON => {
                let buf = read_frame(r)?;
                Body::Json(serde_json::from_slice(&buf).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, e)
                })?)
            }
            BODY_RAW => Body::Raw(read_frame(r)?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown payload kind",
                ))
            }
        };

        let mtype = MessageType::from_u8(read_u8(r)?).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unknown message type")
        })?;
        let flags = read_u8(r)?;
        let userid = read_u32_le(r)?;
        let rolemask = read_u32_le(r)?;
        let aux1 = read_u32_le(r)?;
        let aux2 = read_u32_le(r)?;

        let mut msg = Message::new(mtype);
        msg.topic = topic;
        msg.flags = flags;
        msg.cred = Credentials::new(userid, rolemask);
        msg.body = body;
        msg.route = route;
        match mtype {
            MessageType::Request => {
                msg.nodeid = aux1;
                msg.matchtag = aux2;
            }
            MessageType::Response => {
                msg.errnum = aux1;
                msg.matchtag = aux2;
            }
            MessageType::Event => {
                msg.seq = aux1;
            }
            MessageType::Keepalive => {
                msg.errnum = aux1;
                msg.status = aux2;
            }
        }
        Ok(msg)
    }
}

/// AsyncQueue is a thin wrapper of async_channel.
#[derive(Clone)]
pub struct AsyncQueue<M: Clone> {
    receiver: async_channel::Receiver<M>,
    sender: async_channel::Sender<M>,
    label: &'static str,
}

impl<M: Clone> AsyncQueue<M> {
    pub fn bounded(cap: usize, label: &'static str) -> Self {
        let (sender, receiver) = async_channel::bounded(cap);
        Self {
            receiver,
            sender,
            label,
        }
    }

    pub fn unbounded(label: &'static str) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            receiver,
            sender,
            label,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn send(&self, msg: M) -> async_channel::Send<'_, M> {
        self.sender.send(msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), TrySendError<M>> {
        self.sender.try_send(msg)
    }

    pub fn recv(&self) -> async_channel::Recv<'_, M> {
        self.receiver.recv()
    }

    /// Blocking variants for worker threads living outside the runtime.
    pub fn send_blocking(
        &self,
        msg: M,
    ) -> Result<(), async_channel::SendError<M>> {
        self.sender.send_blocking(msg)
    }

    pub fn recv_blocking(&self) -> Result<M, async_channel::RecvError> {
        self.receiver.recv_blocking()
    }

    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
