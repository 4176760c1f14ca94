//! Transport collaborators: channels and the factory/selector that owns them.
//!
//! # Design
//! The engine never touches sockets. A `Transport` opens channels and blocks
//! on their readiness; a `Channel` frames requests and responses over one
//! resolved address. Everything a channel has to report (completed responses,
//! pushed streams, pings) is appended to an event buffer during `drain` or
//! `flush`, and the owning connection handles it before the tick moves on.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Result;
use crate::http::{Request, Response};
use crate::options::{Options, TransportKind};
use crate::origin::Origin;

/// Transport-assigned channel identity, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Opened but not yet connected.
    Idle,
    Active,
    Closed,
}

/// What the channel wants after a drain or flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Peer closed, protocol shutdown or unrecoverable framing error.
    Close,
}

/// Notifications raised by a channel while draining or flushing.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connected (and negotiated) with the peer.
    Open,
    /// A response for a request sent on this channel. The request travels
    /// back with it so its origin and headers can be inspected.
    Response { request: Box<Request>, response: Response },
    /// The peer pushed a stream.
    Promise { stream_id: u32 },
    /// `origin` was coalesced onto this channel but must not be (e.g. the
    /// certificate does not cover it).
    Uncoalesce { origin: Origin },
    Pong,
    /// The channel cannot take more requests (e.g. stream ids ran out).
    Exhausted,
}

/// One multiplexed transport connection to a resolved address.
pub trait Channel {
    fn id(&self) -> ChannelId;
    fn remote_addr(&self) -> IpAddr;
    fn remote_port(&self) -> u16;
    /// Origin the channel was opened for.
    fn origin(&self) -> &Origin;
    fn state(&self) -> ChannelState;
    /// Whether a request handed over now would be written without waiting.
    fn accepts_requests(&self) -> bool;
    fn send(&mut self, request: Request);
    /// Bytes waiting to be written, including an unfinished connect.
    fn has_pending_output(&self) -> bool;
    /// Requests written and still awaiting their response.
    fn inflight(&self) -> usize;
    fn drain(&mut self, events: &mut Vec<ChannelEvent>) -> io::Result<Flow>;
    fn flush(&mut self, events: &mut Vec<ChannelEvent>) -> io::Result<Flow>;
    /// Start closing. May take several ticks; see [`is_closed`](Self::is_closed).
    fn close(&mut self);

    fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Reject a pushed stream.
    fn refuse_push(&mut self, _stream_id: u32) {}
}

/// Readiness interest for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub channel: ChannelId,
    pub read: bool,
    pub write: bool,
}

/// Readiness reported for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub channel: ChannelId,
    pub readable: bool,
    pub writable: bool,
}

/// Channel factory plus the readiness primitive its channels share.
pub trait Transport {
    fn open(
        &self,
        kind: TransportKind,
        target: &Origin,
        addr: IpAddr,
        options: &Options,
    ) -> Result<Box<dyn Channel>>;

    /// Block until at least one interest is satisfied or `timeout` passes.
    /// An empty result means the wait timed out.
    fn select(&self, interests: &[Interest], timeout: Duration) -> io::Result<Vec<Readiness>>;
}

