//! Deterministic in-memory network for exercising the engine.
//!
//! # Design
//! `MockNetwork` is a cheap clonable handle to shared state and plays every
//! collaborator at once: it resolves hostnames from a static table, opens
//! channels, and answers readiness waits without sleeping. A channel connects
//! on its first flush, writes queued requests on the next one, and completes
//! one written request per drain. Which request completes first is chosen by
//! the configured completion order, so tests can force out-of-order delivery.
//!
//! Responses come from per-host routes keyed by the host the channel was
//! opened for; unrouted requests get `200` with `host + path` as the body.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use httpmux_core::options::ALPN_PROTOCOLS;
use httpmux_core::{
    Channel, ChannelEvent, ChannelId, ChannelState, Error, Flow, Interest, Options, Origin, Readiness,
    Request, Resolver, Response, Transport, TransportKind,
};
use log::debug;

/// A request as it left a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub channel: ChannelId,
    /// Host the channel was opened for.
    pub host: String,
    pub uri: String,
    pub path: String,
    pub alt_used: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// A channel as it was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub channel: ChannelId,
    pub origin: Origin,
    pub addr: IpAddr,
    pub kind: TransportKind,
    pub alpn: Option<String>,
    pub connect_timeout: Duration,
}

struct Slot {
    origin: Origin,
    state: ChannelState,
    closing: bool,
    outbound: VecDeque<Request>,
    inflight: Vec<Request>,
    injected: VecDeque<ChannelEvent>,
    max_concurrent: usize,
}

#[derive(Default)]
struct State {
    hosts: HashMap<String, IpAddr>,
    routes: HashMap<(String, String), Response>,
    completion_order: Vec<String>,
    blackholed: HashSet<String>,
    refused: HashSet<String>,
    failing: HashSet<String>,
    scripted: HashMap<String, Vec<ChannelEvent>>,
    max_concurrent: Option<usize>,
    graceful_close: bool,
    next_channel: u64,
    slots: BTreeMap<ChannelId, Slot>,
    opened: Vec<Opened>,
    writes: Vec<Sent>,
    refused_pushes: Vec<(ChannelId, u32)>,
    timeouts: usize,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Rc<RefCell<State>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collaborator handles for building a pool or session.
    pub fn transport(&self) -> Rc<dyn Transport> {
        Rc::new(self.clone())
    }

    pub fn resolver(&self) -> Rc<dyn Resolver> {
        Rc::new(self.clone())
    }

    pub fn add_host(&self, host: &str, ip: &str) -> &Self {
        let ip = ip.parse().unwrap_or_else(|_| panic!("bad ip {ip}"));
        self.state.borrow_mut().hosts.insert(host.to_string(), ip);
        self
    }

    pub fn route(&self, host: &str, path: &str, response: Response) -> &Self {
        self.state
            .borrow_mut()
            .routes
            .insert((host.to_string(), path.to_string()), response);
        self
    }

    /// Complete written requests by path in this order. Unlisted paths
    /// complete after listed ones, oldest first.
    pub fn complete_in_order(&self, paths: &[&str]) -> &Self {
        self.state.borrow_mut().completion_order = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Requests to `host` are written but never answered.
    pub fn blackhole(&self, host: &str) -> &Self {
        self.state.borrow_mut().blackholed.insert(host.to_string());
        self
    }

    /// Opening a channel to `host` fails.
    pub fn refuse(&self, host: &str) -> &Self {
        self.state.borrow_mut().refused.insert(host.to_string());
        self
    }

    /// Reads on connected channels to `host` fail with an I/O error.
    pub fn fail_reads(&self, host: &str) -> &Self {
        self.state.borrow_mut().failing.insert(host.to_string());
        self
    }

    /// Undo `blackhole`, `refuse` and `fail_reads` for `host`.
    pub fn restore(&self, host: &str) -> &Self {
        let mut state = self.state.borrow_mut();
        state.blackholed.remove(host);
        state.refused.remove(host);
        state.failing.remove(host);
        self
    }

    /// Cap requests per channel (queued plus in flight), like an HTTP/1.1
    /// channel without pipelining when `n` is 1.
    pub fn max_concurrent(&self, n: usize) -> &Self {
        self.state.borrow_mut().max_concurrent = Some(n);
        self
    }

    /// Closing a channel takes one more tick to complete.
    pub fn graceful_close(&self, enabled: bool) -> &Self {
        self.state.borrow_mut().graceful_close = enabled;
        self
    }

    /// Raise `event` on the first drain of the next channel opened for `host`.
    pub fn inject_on_open(&self, host: &str, event: ChannelEvent) -> &Self {
        self.state
            .borrow_mut()
            .scripted
            .entry(host.to_string())
            .or_default()
            .push(event);
        self
    }

    /// Raise `event` on the channel's next drain.
    pub fn inject(&self, channel: ChannelId, event: ChannelEvent) {
        if let Some(slot) = self.state.borrow_mut().slots.get_mut(&channel) {
            slot.injected.push_back(event);
        }
    }

    pub fn opened(&self) -> Vec<Opened> {
        self.state.borrow().opened.clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.borrow().writes.clone()
    }

    /// Paths written on channels opened for `host`.
    pub fn paths_sent_to(&self, host: &str) -> Vec<String> {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|w| w.host == host)
            .map(|w| w.path.clone())
            .collect()
    }

    pub fn refused_pushes(&self) -> Vec<(ChannelId, u32)> {
        self.state.borrow().refused_pushes.clone()
    }

    /// Readiness waits that found nothing ready.
    pub fn timeouts(&self) -> usize {
        self.state.borrow().timeouts
    }

    pub fn channel_state(&self, channel: ChannelId) -> Option<ChannelState> {
        self.state.borrow().slots.get(&channel).map(|s| s.state)
    }
}

impl Resolver for MockNetwork {
    fn resolve(&self, host: &str) -> httpmux_core::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        self.state
            .borrow()
            .hosts
            .get(host)
            .copied()
            .ok_or_else(|| Error::Resolve {
                host: host.to_string(),
                reason: "NXDOMAIN".to_string(),
            })
    }
}

impl Transport for MockNetwork {
    fn open(
        &self,
        kind: TransportKind,
        target: &Origin,
        addr: IpAddr,
        options: &Options,
    ) -> httpmux_core::Result<Box<dyn Channel>> {
        let mut state = self.state.borrow_mut();
        if state.refused.contains(&target.host) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, target.to_string()).into());
        }
        let id = ChannelId(state.next_channel);
        state.next_channel += 1;
        let max_concurrent = options
            .max_concurrent_requests
            .map(|n| n as usize)
            .or(state.max_concurrent)
            .unwrap_or(usize::MAX);
        let injected = state.scripted.remove(&target.host).unwrap_or_default();
        state.slots.insert(
            id,
            Slot {
                origin: target.clone(),
                state: ChannelState::Idle,
                closing: false,
                outbound: VecDeque::new(),
                inflight: Vec::new(),
                injected: injected.into(),
                max_concurrent,
            },
        );
        state.opened.push(Opened {
            channel: id,
            origin: target.clone(),
            addr,
            kind,
            alpn: options.ssl.get(ALPN_PROTOCOLS).cloned(),
            connect_timeout: options.connect_timeout(),
        });
        debug!("mock: opened {id} to {target} at {addr}");
        Ok(Box::new(MockChannel {
            id,
            origin: target.clone(),
            addr,
            network: self.clone(),
        }))
    }

    fn select(&self, interests: &[Interest], _timeout: Duration) -> io::Result<Vec<Readiness>> {
        let mut state = self.state.borrow_mut();
        let ready: Vec<Readiness> = interests
            .iter()
            .filter_map(|interest| {
                let slot = state.slots.get(&interest.channel)?;
                if slot.state == ChannelState::Closed {
                    return None;
                }
                let host = &slot.origin.host;
                let answering = !slot.inflight.is_empty() && !state.blackholed.contains(host);
                let failing = slot.state == ChannelState::Active && state.failing.contains(host);
                let readable =
                    interest.read && (slot.closing || answering || failing || !slot.injected.is_empty());
                let writable = interest.write
                    && (slot.closing || slot.state == ChannelState::Idle || !slot.outbound.is_empty());
                (readable || writable).then_some(Readiness {
                    channel: interest.channel,
                    readable,
                    writable,
                })
            })
            .collect();
        if ready.is_empty() {
            state.timeouts += 1;
        }
        Ok(ready)
    }
}

struct MockChannel {
    id: ChannelId,
    origin: Origin,
    addr: IpAddr,
    network: MockNetwork,
}

impl MockChannel {
    fn with_slot<T>(&self, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        self.network.state.borrow_mut().slots.get_mut(&self.id).map(f)
    }

    /// Finish a graceful close if one is underway.
    fn finish_close(&self) -> Option<Flow> {
        self.with_slot(|slot| {
            slot.closing.then(|| {
                slot.state = ChannelState::Closed;
                Flow::Close
            })
        })
        .flatten()
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_addr(&self) -> IpAddr {
        self.addr
    }

    fn remote_port(&self) -> u16 {
        self.origin.port
    }

    fn origin(&self) -> &Origin {
        &self.origin
    }

    fn state(&self) -> ChannelState {
        self.with_slot(|slot| slot.state).unwrap_or(ChannelState::Closed)
    }

    fn accepts_requests(&self) -> bool {
        self.with_slot(|slot| {
            slot.state == ChannelState::Active
                && !slot.closing
                && slot.outbound.len() + slot.inflight.len() < slot.max_concurrent
        })
        .unwrap_or(false)
    }

    fn send(&mut self, request: Request) {
        self.with_slot(|slot| slot.outbound.push_back(request));
    }

    fn has_pending_output(&self) -> bool {
        self.with_slot(|slot| slot.state == ChannelState::Idle || !slot.outbound.is_empty())
            .unwrap_or(false)
    }

    fn inflight(&self) -> usize {
        self.with_slot(|slot| slot.inflight.len()).unwrap_or(0)
    }

    fn drain(&mut self, events: &mut Vec<ChannelEvent>) -> io::Result<Flow> {
        if let Some(flow) = self.finish_close() {
            return Ok(flow);
        }
        let mut state = self.network.state.borrow_mut();
        let state = &mut *state;
        let Some(slot) = state.slots.get_mut(&self.id) else {
            return Ok(Flow::Close);
        };
        events.extend(slot.injected.drain(..));
        if slot.state == ChannelState::Active && state.failing.contains(&slot.origin.host) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }
        if state.blackholed.contains(&slot.origin.host) || slot.inflight.is_empty() {
            return Ok(Flow::Continue);
        }

        let rank = |request: &Request| {
            state
                .completion_order
                .iter()
                .position(|p| p == request.uri.path())
                .unwrap_or(usize::MAX)
        };
        let next = (0..slot.inflight.len())
            .min_by_key(|&i| (rank(&slot.inflight[i]), i))
            .unwrap_or(0);
        let request = slot.inflight.remove(next);
        let path = request.uri.path().to_string();
        let response = state
            .routes
            .get(&(slot.origin.host.clone(), path.clone()))
            .cloned()
            .unwrap_or_else(|| Response::new(200).with_body(format!("{}{path}", slot.origin.host)));
        debug!("mock: {} answered {path} with {}", self.id, response.status);
        events.push(ChannelEvent::Response {
            request: Box::new(request),
            response,
        });
        Ok(Flow::Continue)
    }

    fn flush(&mut self, events: &mut Vec<ChannelEvent>) -> io::Result<Flow> {
        if let Some(flow) = self.finish_close() {
            return Ok(flow);
        }
        let mut state = self.network.state.borrow_mut();
        let state = &mut *state;
        let Some(slot) = state.slots.get_mut(&self.id) else {
            return Ok(Flow::Close);
        };
        if slot.state == ChannelState::Idle {
            slot.state = ChannelState::Active;
            events.push(ChannelEvent::Open);
            return Ok(Flow::Continue);
        }
        while let Some(request) = slot.outbound.pop_front() {
            state.writes.push(Sent {
                channel: self.id,
                host: slot.origin.host.clone(),
                uri: request.uri.to_string(),
                path: request.uri.path().to_string(),
                alt_used: request.header("alt-used").map(str::to_string),
                headers: request.headers.clone(),
            });
            slot.inflight.push(request);
        }
        Ok(Flow::Continue)
    }

    fn close(&mut self) {
        let graceful = self.network.state.borrow().graceful_close;
        self.with_slot(|slot| {
            if graceful && slot.state != ChannelState::Closed {
                slot.closing = true;
            } else {
                slot.state = ChannelState::Closed;
            }
        });
    }

    fn refuse_push(&mut self, stream_id: u32) {
        self.network
            .state
            .borrow_mut()
            .refused_pushes
            .push((self.id, stream_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmux_core::HttpMethod;

    fn network() -> MockNetwork {
        let network = MockNetwork::new();
        network.add_host("example.com", "10.0.0.1");
        network
    }

    fn open(network: &MockNetwork) -> Box<dyn Channel> {
        let origin = Origin::new("http", "example.com", 80);
        network
            .open(TransportKind::Tcp, &origin, "10.0.0.1".parse().unwrap(), &Options::default())
            .unwrap()
    }

    #[test]
    fn resolves_table_and_literals() {
        let network = network();
        assert_eq!(network.resolve("example.com").unwrap().to_string(), "10.0.0.1");
        assert_eq!(network.resolve("127.0.0.1").unwrap().to_string(), "127.0.0.1");
        assert!(matches!(network.resolve("nowhere.test"), Err(Error::Resolve { .. })));
    }

    #[test]
    fn channel_connects_then_writes_then_answers() {
        let network = network();
        let mut channel = open(&network);
        let mut events = Vec::new();

        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(channel.has_pending_output());
        assert!(!channel.accepts_requests());

        channel.flush(&mut events).unwrap();
        assert!(matches!(events.as_slice(), [ChannelEvent::Open]));
        assert_eq!(channel.state(), ChannelState::Active);

        channel.send(Request::new(HttpMethod::Get, "http://example.com/a").unwrap());
        assert!(channel.has_pending_output());
        channel.flush(&mut events).unwrap();
        assert_eq!(channel.inflight(), 1);
        assert_eq!(network.paths_sent_to("example.com"), vec!["/a"]);

        events.clear();
        channel.drain(&mut events).unwrap();
        match events.as_slice() {
            [ChannelEvent::Response { response, .. }] => assert_eq!(response.body, "example.com/a"),
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(channel.inflight(), 0);
    }

    #[test]
    fn select_reports_nothing_when_blackholed() {
        let network = network();
        network.blackhole("example.com");
        let mut channel = open(&network);
        let mut events = Vec::new();
        channel.flush(&mut events).unwrap();
        channel.send(Request::new(HttpMethod::Get, "http://example.com/a").unwrap());
        channel.flush(&mut events).unwrap();

        let interest = Interest {
            channel: channel.id(),
            read: true,
            write: channel.has_pending_output(),
        };
        let ready = network.select(&[interest], Duration::from_millis(1)).unwrap();
        assert!(ready.is_empty());
        assert_eq!(network.timeouts(), 1);
    }

    #[test]
    fn graceful_close_takes_a_tick() {
        let network = network();
        network.graceful_close(true);
        let mut channel = open(&network);
        channel.close();
        assert!(!channel.is_closed());
        assert_eq!(channel.drain(&mut Vec::new()).unwrap(), Flow::Close);
        assert!(channel.is_closed());
    }
}
