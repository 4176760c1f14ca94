//! Per-coalescing-group channel aggregator.
//!
//! # Design
//! A `Connection` serves one or more origins and owns every channel needed to
//! reach them. Channels are keyed by what was actually dialled, the resolved
//! address, port and scheme, so hostnames that resolve to the same address
//! share one channel.
//!
//! Requests wait in the connection's idle queue until their channel accepts
//! them. They are only handed over at the start of a tick, so anything raised
//! while a tick drains (an Alt-Svc advertisement, say) is handled while the
//! queued requests can still be rerouted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};

use crate::altsvc::parser::advertisements;
use crate::channel::{Channel, ChannelEvent, ChannelId, Flow, Interest, Transport};
use crate::error::{Error, Result};
use crate::http::{Request, RequestId, RequestState, Response};
use crate::options::{Options, TransportKind};
use crate::origin::Origin;
use crate::resolver::Resolver;

/// Notifications a connection raises during [`Connection::process_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open { channel: ChannelId },
    /// The response for `request` is ready to be taken with
    /// [`Connection::response`].
    Response { request: RequestId },
    AltSvc {
        alt_origin: Origin,
        origin: Origin,
        params: BTreeMap<String, String>,
    },
    Promise { channel: ChannelId, stream_id: u32 },
    Uncoalesce { origin: Origin },
    Pong,
    Exhausted { channel: ChannelId },
}

pub struct Connection {
    origins: Vec<Origin>,
    options: Options,
    kind: TransportKind,
    channel_options: Options,
    resolver: Rc<dyn Resolver>,
    transport: Rc<dyn Transport>,
    channels: Vec<Box<dyn Channel>>,
    pending: VecDeque<(ChannelId, Request)>,
    responses: HashMap<RequestId, Response>,
    /// In-flight requests nobody will collect; their responses are dropped.
    abandoned: HashSet<RequestId>,
}

enum Op {
    Drain,
    Flush,
}

/// Transport for `origin`, with the options its channels are opened with.
fn select_transport(origin: &Origin, options: &Options) -> Result<(TransportKind, Options)> {
    if let Some(kind) = options.transport {
        return Ok((kind, options.clone()));
    }
    match origin.scheme.as_str() {
        "http" => Ok((TransportKind::Tcp, options.clone())),
        "https" => Ok((TransportKind::Tls, options.clone())),
        "h2" => Ok((TransportKind::Tls, options.with_alpn("h2"))),
        _ => Err(Error::UnsupportedScheme {
            origin: origin.clone(),
        }),
    }
}

impl Connection {
    pub fn new(
        origin: Origin,
        options: Options,
        resolver: Rc<dyn Resolver>,
        transport: Rc<dyn Transport>,
    ) -> Result<Self> {
        let (kind, channel_options) = select_transport(&origin, &options)?;
        Ok(Self {
            origins: vec![origin],
            options,
            kind,
            channel_options,
            resolver,
            transport,
            channels: Vec::new(),
            pending: VecDeque::new(),
            responses: HashMap::new(),
            abandoned: HashSet::new(),
        })
    }

    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&dyn Channel> {
        self.channels.iter().find(|c| c.id() == id).map(|c| c.as_ref())
    }

    /// Number of requests still waiting for a channel.
    pub fn idle_requests(&self) -> usize {
        self.pending.len()
    }

    /// Whether this connection serves `origin` over equivalent transport
    /// settings.
    pub fn matches(&self, origin: &Origin, options: &Options) -> bool {
        self.options.same_transport(options) && self.origins.contains(origin)
    }

    /// Whether `origin` resolves to an address one of the open channels
    /// already targets.
    pub fn can_coalesce(&self, origin: &Origin, options: &Options) -> bool {
        let same_scheme = self.origins.first().is_some_and(|o| o.scheme == origin.scheme);
        if !same_scheme || !self.options.same_transport(options) {
            return false;
        }
        let Ok(addr) = self.resolver.resolve(&origin.host) else {
            return false;
        };
        self.channels.iter().any(|c| {
            !c.is_closed() && c.remote_addr() == addr && c.remote_port() == origin.port
        })
    }

    pub fn merge_origin(&mut self, origin: Origin) {
        if !self.origins.contains(&origin) {
            self.origins.push(origin);
        }
    }

    /// Channel reaching `origin`, opening one only when no open channel
    /// targets the same address, port and scheme.
    pub fn bind(&mut self, origin: &Origin) -> Result<ChannelId> {
        let addr = self.resolver.resolve(&origin.host)?;
        let existing = self.channels.iter().find(|c| {
            !c.is_closed()
                && c.remote_addr() == addr
                && c.remote_port() == origin.port
                && c.origin().scheme == origin.scheme
        });
        if let Some(channel) = existing {
            return Ok(channel.id());
        }

        let channel = self
            .transport
            .open(self.kind, origin, addr, &self.channel_options)?;
        let id = channel.id();
        debug!("{origin}: opened channel {id} to {addr}:{}", origin.port);
        self.channels.push(channel);
        Ok(id)
    }

    /// Queue `request` on the channel for its target.
    pub fn send(&mut self, mut request: Request) -> Result<()> {
        let target = request.target().clone();
        let channel = self.bind(&target).map_err(|e| Error::ConnectionUnavailable {
            origin: target,
            reason: e.to_string(),
        })?;
        request.state = RequestState::Idle;
        self.pending.push_back((channel, request));
        Ok(())
    }

    /// Take the completed response for `request`. Each response is handed
    /// out once.
    pub fn response(&mut self, request: &RequestId) -> Option<Response> {
        self.responses.remove(request)
    }

    /// Stop waiting for `request`: a stored response is dropped now, a late
    /// one when it arrives.
    pub fn abandon(&mut self, request: RequestId) {
        if self.responses.remove(&request).is_none() {
            self.abandoned.insert(request);
        }
    }

    /// Number of responses stored and not yet taken.
    pub fn stored_responses(&self) -> usize {
        self.responses.len()
    }

    /// Remove and return idle requests matching `predicate`, oldest first.
    pub fn purge_pending(&mut self, mut predicate: impl FnMut(&Request) -> bool) -> Vec<Request> {
        let mut purged = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for (channel, request) in self.pending.drain(..) {
            if predicate(&request) {
                purged.push(request);
            } else {
                kept.push_back((channel, request));
            }
        }
        self.pending = kept;
        purged
    }

    /// Whether anything is queued, unwritten or awaiting a response.
    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty()
            || self
                .channels
                .iter()
                .any(|c| !c.is_closed() && (c.inflight() > 0 || c.has_pending_output()))
    }

    /// One readiness cycle over the owned channels.
    pub fn process_events(&mut self, timeout: Duration) -> Result<Vec<ConnectionEvent>> {
        self.channels.retain(|c| !c.is_closed());
        self.dispatch_pending()?;

        let interests: Vec<Interest> = self
            .channels
            .iter()
            .map(|c| Interest {
                channel: c.id(),
                read: true,
                write: c.has_pending_output(),
            })
            .collect();
        if interests.is_empty() {
            return Ok(Vec::new());
        }

        let ready = self.transport.select(&interests, timeout)?;
        if ready.is_empty() {
            return Err(Error::Timeout { timeout });
        }

        let mut events = Vec::new();
        for readiness in ready.iter().filter(|r| r.readable) {
            self.service(readiness.channel, Op::Drain, &mut events);
        }
        for readiness in ready.iter().filter(|r| r.writable) {
            self.service(readiness.channel, Op::Flush, &mut events);
        }
        Ok(events)
    }

    /// Close one channel, or every channel when `channel` is `None`. A
    /// channel whose close is still in progress stays owned until a later
    /// tick sees it closed.
    pub fn close(&mut self, channel: Option<ChannelId>) {
        match channel {
            Some(id) => {
                let Some(index) = self.channels.iter().position(|c| c.id() == id) else {
                    return;
                };
                self.channels[index].close();
                if self.channels[index].is_closed() {
                    let closed = self.channels.remove(index);
                    if closed.inflight() > 0 {
                        warn!("channel {id} closed with {} request(s) in flight", closed.inflight());
                    }
                }
            }
            None => {
                for mut channel in self.channels.drain(..) {
                    channel.close();
                }
                self.pending.clear();
                self.abandoned.clear();
            }
        }
    }

    pub fn refuse_push(&mut self, channel: ChannelId, stream_id: u32) {
        if let Some(c) = self.channels.iter_mut().find(|c| c.id() == channel) {
            c.refuse_push(stream_id);
        }
    }

    /// Split `origin` off into `other`: the origin, its idle requests and the
    /// channels opened for it move over. Returns the ids of moved requests.
    /// A connection never gives up its last origin.
    pub fn unmerge(&mut self, origin: &Origin, other: &mut Connection) -> Result<Vec<RequestId>> {
        if self.origins.len() <= 1 || !self.origins.contains(origin) {
            debug!("{origin}: not split off, connection serves {:?}", self.origins);
            return Ok(Vec::new());
        }
        self.origins.retain(|o| o != origin);

        let (leaving, staying): (Vec<_>, Vec<_>) = std::mem::take(&mut self.channels)
            .into_iter()
            .partition(|c| c.origin() == origin);
        self.channels = staying;
        other.channels.extend(leaving);

        let moved = self.purge_pending(|r| r.origin() == origin);
        let ids = moved.iter().map(Request::id).collect();
        for request in moved {
            other.send(request)?;
        }
        Ok(ids)
    }

    /// Hand idle requests to their channels while the channels take them.
    fn dispatch_pending(&mut self) -> Result<()> {
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some((mut id, mut request)) = self.pending.pop_front() {
            let index = match self.position(id) {
                Some(index) => Ok(index),
                // the channel went away while the request waited
                None => self.rebind(&mut id, request.target()),
            };
            let index = match index {
                Ok(index) => index,
                Err(e) => {
                    waiting.push_back((id, request));
                    waiting.append(&mut self.pending);
                    self.pending = waiting;
                    return Err(e);
                }
            };
            let channel = &mut self.channels[index];
            if channel.accepts_requests() {
                request.state = RequestState::Dispatched;
                debug!("{} {} dispatched on channel {id}", request.method, request.uri);
                channel.send(request);
            } else {
                waiting.push_back((id, request));
            }
        }
        self.pending = waiting;
        Ok(())
    }

    fn rebind(&mut self, id: &mut ChannelId, target: &Origin) -> Result<usize> {
        *id = self.bind(target)?;
        self.position(*id).ok_or_else(|| Error::ConnectionUnavailable {
            origin: target.clone(),
            reason: format!("channel {id} closed"),
        })
    }

    fn position(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|c| c.id() == id && !c.is_closed())
    }

    fn service(&mut self, id: ChannelId, op: Op, events: &mut Vec<ConnectionEvent>) {
        let Some(index) = self.position(id) else {
            return;
        };
        let mut raised = Vec::new();
        let channel = &mut self.channels[index];
        let flow = match op {
            Op::Drain => channel.drain(&mut raised),
            Op::Flush => channel.flush(&mut raised),
        };
        for event in raised {
            self.handle_channel_event(id, event, events);
        }
        match flow {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => self.close(Some(id)),
            Err(e) => {
                warn!("channel {id}: {e}");
                self.close(Some(id));
            }
        }
    }

    fn handle_channel_event(&mut self, channel: ChannelId, event: ChannelEvent, events: &mut Vec<ConnectionEvent>) {
        match event {
            ChannelEvent::Open => events.push(ConnectionEvent::Open { channel }),
            ChannelEvent::Response { mut request, response } => {
                for (alt_origin, origin, params) in advertisements(&request, &response) {
                    events.push(ConnectionEvent::AltSvc {
                        alt_origin,
                        origin,
                        params,
                    });
                }
                let id = request.id();
                if self.abandoned.remove(&id) {
                    debug!("{} {} answered after its batch failed, dropped", request.method, request.uri);
                    return;
                }
                request.state = RequestState::Completed;
                debug!("{} {} {:?} with {}", request.method, request.uri, request.state, response.status);
                self.responses.insert(id, response);
                events.push(ConnectionEvent::Response { request: id });
            }
            ChannelEvent::Promise { stream_id } => {
                events.push(ConnectionEvent::Promise { channel, stream_id })
            }
            ChannelEvent::Uncoalesce { origin } => events.push(ConnectionEvent::Uncoalesce { origin }),
            ChannelEvent::Pong => events.push(ConnectionEvent::Pong),
            ChannelEvent::Exhausted => events.push(ConnectionEvent::Exhausted { channel }),
        }
    }
}
