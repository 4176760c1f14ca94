//! Batch dispatch with ordered collection and Alt-Svc rerouting.
//!
//! # Design
//! `Session` owns a [`Pool`] and a `Dispatcher`. The dispatcher is the pool's
//! event handler: it remembers which connection every outstanding request
//! lives on, reacts to Alt-Svc advertisements and uncoalesce signals, and
//! counts lifecycle events. Keeping it a separate field lets the pool borrow
//! it mutably while it is itself borrowed by the session.
//!
//! Responses are collected strictly in submission order: the session ticks the
//! pool until the first outstanding request has its response, then moves on,
//! whatever order the transports completed them in. A failed batch returns
//! only the error; responses collected before the failure are dropped.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use log::{debug, info, warn};

use crate::altsvc::{AltSvcCache, AltSvcEntry};
use crate::channel::Transport;
use crate::connection::ConnectionEvent;
use crate::error::{Error, Result};
use crate::http::{HttpMethod, Request, RequestId, RequestState, Response};
use crate::options::{Options, OptionsPatch};
use crate::origin::Origin;
use crate::pool::{ConnectionId, EventHandler, Pool};
use crate::resolver::Resolver;

/// Lifecycle events counted over the session's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connections_opened: usize,
    pub pings: usize,
    pub exhausted: usize,
    pub refused_pushes: usize,
}

struct Dispatcher {
    options: Options,
    altsvc: AltSvcCache,
    routes: HashMap<RequestId, ConnectionId>,
    touched: Vec<ConnectionId>,
    stats: SessionStats,
}

pub struct Session {
    options: Options,
    pool: Pool,
    dispatcher: Dispatcher,
    keep_open: bool,
}

impl Session {
    pub fn new(options: Options, resolver: Rc<dyn Resolver>, transport: Rc<dyn Transport>) -> Self {
        Self {
            dispatcher: Dispatcher {
                options: options.clone(),
                altsvc: AltSvcCache::global(),
                routes: HashMap::new(),
                touched: Vec::new(),
                stats: SessionStats::default(),
            },
            options,
            pool: Pool::new(resolver, transport),
            keep_open: false,
        }
    }

    /// Use `cache` instead of the process-wide Alt-Svc cache.
    pub fn with_altsvc_cache(mut self, cache: AltSvcCache) -> Self {
        self.dispatcher.altsvc = cache;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn stats(&self) -> SessionStats {
        self.dispatcher.stats
    }

    /// Run `f` with connections kept open between batches.
    pub fn wrap<T>(&mut self, f: impl FnOnce(&mut Session) -> T) -> T {
        let previous = self.keep_open;
        self.keep_open = true;
        let out = f(self);
        self.keep_open = previous;
        out
    }

    pub fn close(&mut self) {
        self.pool.close(None);
    }

    pub fn get(&mut self, uri: &str) -> Result<Response> {
        let mut responses = self.request(&[(HttpMethod::Get, uri)])?;
        responses
            .pop()
            .ok_or_else(|| Error::Usage("no response collected".to_string()))
    }

    /// Send a batch and return its responses in the order given.
    pub fn request(&mut self, batch: &[(HttpMethod, &str)]) -> Result<Vec<Response>> {
        self.request_with(batch, &OptionsPatch::default())
    }

    /// Like [`request`](Self::request) with per-batch option overrides.
    pub fn request_with(&mut self, batch: &[(HttpMethod, &str)], patch: &OptionsPatch) -> Result<Vec<Response>> {
        let options = self.options.merge(patch)?;
        let requests = batch
            .iter()
            .map(|(method, uri)| build_request(*method, uri, &options))
            .collect::<Result<Vec<_>>>()?;
        self.dispatcher.options = options;
        let result = self.send_requests(requests);
        self.dispatcher.options = self.options.clone();
        result
    }

    /// Submit and collect already-built requests.
    pub fn send_requests(&mut self, requests: Vec<Request>) -> Result<Vec<Response>> {
        if requests.is_empty() {
            return Err(Error::Usage("wrong number of URIs (given 0, expect 1..+1)".to_string()));
        }
        let ids: Vec<RequestId> = requests.iter().map(Request::id).collect();
        self.dispatcher.touched.clear();

        let result = self.submit(requests).and_then(|_| self.collect(&ids));

        if result.is_err() {
            self.abandon(&ids);
        }
        if !self.keep_open && !self.dispatcher.options.persistent {
            let touched = std::mem::take(&mut self.dispatcher.touched);
            self.pool.close(Some(&touched));
        }
        result
    }

    /// Queue every request on its connection, in order. Returns the distinct
    /// connections touched by this batch so far.
    pub fn submit(&mut self, requests: Vec<Request>) -> Result<Vec<ConnectionId>> {
        for mut request in requests {
            let connection = self.route(&mut request)?;
            self.dispatcher.touch(connection);
            let id = request.id();
            let Some(conn) = self.pool.connection_mut(connection) else {
                return Err(Error::ConnectionUnavailable {
                    origin: request.origin().clone(),
                    reason: format!("{connection} is gone"),
                });
            };
            conn.send(request)?;
            self.dispatcher.routes.insert(id, connection);
        }
        Ok(self.dispatcher.touched.clone())
    }

    /// Wait for each request's response in turn.
    pub fn collect(&mut self, ids: &[RequestId]) -> Result<Vec<Response>> {
        let timeout = self.dispatcher.options.operation_timeout();
        let mut responses = Vec::with_capacity(ids.len());
        for (collected, id) in ids.iter().enumerate() {
            loop {
                if let Some(response) = self.fetch_response(id) {
                    responses.push(response);
                    break;
                }
                let failure = if self.pool.is_empty() {
                    Error::Stalled {
                        pending: ids.len() - collected,
                    }
                } else {
                    match self.pool.next_tick(timeout, &mut self.dispatcher) {
                        Ok(()) => continue,
                        Err(e) => e,
                    }
                };
                if !responses.is_empty() {
                    warn!("discarding {} collected response(s): {failure}", responses.len());
                }
                return Err(failure);
            }
        }
        Ok(responses)
    }

    /// Forget a failed batch: idle requests are dropped, stored responses
    /// discarded and late responses will not be kept.
    fn abandon(&mut self, ids: &[RequestId]) {
        for id in ids {
            // collected ones are already unrouted
            let Some(connection) = self.dispatcher.routes.remove(id) else {
                continue;
            };
            let Some(conn) = self.pool.connection_mut(connection) else {
                continue;
            };
            let purged = conn.purge_pending(|r| r.id() == *id);
            if purged.is_empty() {
                conn.abandon(*id);
            }
            for mut request in purged {
                request.state = RequestState::Errored;
                debug!("{} {} abandoned", request.method, request.uri);
            }
        }
    }

    fn fetch_response(&mut self, id: &RequestId) -> Option<Response> {
        let connection = *self.dispatcher.routes.get(id)?;
        let response = self.pool.connection_mut(connection)?.response(id)?;
        self.dispatcher.routes.remove(id);
        Some(response)
    }

    /// Connection for a new request: a cached Alt-Svc alternate of its origin
    /// when one is usable, else the origin's own connection.
    fn route(&mut self, request: &mut Request) -> Result<ConnectionId> {
        let origin = request.origin().clone();
        if !request.uses_alternate() {
            for entry in self.dispatcher.altsvc.get(&origin) {
                match self.reach_alternate(&entry.origin) {
                    Ok(connection) => {
                        debug!("{origin}: using cached alternate {}", entry.origin);
                        request.reroute(&entry.origin);
                        return Ok(connection);
                    }
                    Err(e) => {
                        debug!("{origin}: cached alternate {} unusable ({e})", entry.origin);
                        self.dispatcher.altsvc.mark_noop(&origin, &entry.origin);
                    }
                }
            }
        }
        match self.dispatcher.connection_for(&mut self.pool, &origin) {
            Err(Error::UnsupportedScheme { origin }) => Err(Error::ConnectionUnavailable {
                origin,
                reason: "unsupported URI scheme".to_string(),
            }),
            other => other,
        }
    }

    /// Connection for `alternate` with a channel already bound to it.
    fn reach_alternate(&mut self, alternate: &Origin) -> Result<ConnectionId> {
        let connection = self.dispatcher.connection_for(&mut self.pool, alternate)?;
        self.dispatcher.touch(connection);
        match self.pool.connection_mut(connection) {
            Some(conn) => conn.bind(alternate).map(|_| connection),
            None => Err(Error::Usage(format!("{connection} is gone"))),
        }
    }
}

fn build_request(method: HttpMethod, uri: &str, options: &Options) -> Result<Request> {
    let mut request = Request::new(method, uri)?;
    request.headers = options
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(request)
}

impl Dispatcher {
    fn touch(&mut self, connection: ConnectionId) {
        if !self.touched.contains(&connection) {
            self.touched.push(connection);
        }
    }

    fn connection_for(&mut self, pool: &mut Pool, origin: &Origin) -> Result<ConnectionId> {
        match pool.find_connection(origin, &self.options) {
            Some(connection) => Ok(connection),
            None => pool.init_connection(origin.clone(), self.options.clone()),
        }
    }

    fn on_altsvc(
        &mut self,
        pool: &mut Pool,
        existing: ConnectionId,
        alt_origin: Origin,
        origin: Origin,
        params: BTreeMap<String, String>,
    ) -> Result<()> {
        // already known, possibly noop
        let Some(entry) = self.altsvc.set(&origin, AltSvcEntry::new(alt_origin.clone(), params)) else {
            return Ok(());
        };
        if let Ok(json) = serde_json::to_string(&entry) {
            debug!("{origin} alt-svc cached: {json}");
        }

        let alternate = match self.connection_for(pool, &alt_origin) {
            Ok(connection) => connection,
            Err(Error::UnsupportedScheme { .. }) => {
                debug!("{origin} alt-svc: {alt_origin} unsupported, ignoring");
                self.altsvc.mark_noop(&origin, &alt_origin);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if alternate == existing {
            return Ok(());
        }
        self.touch(alternate);
        info!("{origin} alt-svc: {alt_origin}");

        let Some(connection) = pool.connection_mut(existing) else {
            return Ok(());
        };
        let idle = connection.purge_pending(|r| r.origin() == &origin && !r.uses_alternate());
        if idle.is_empty() {
            return Ok(());
        }

        let reachable = match pool.connection_mut(alternate) {
            Some(connection) => connection.bind(&alt_origin).map(|_| ()),
            None => Err(Error::Usage(format!("{alternate} is gone"))),
        };
        if let Err(e) = reachable {
            warn!("{origin} alt-svc: {alt_origin} unreachable ({e}), keeping requests");
            self.altsvc.mark_noop(&origin, &alt_origin);
            if let Some(connection) = pool.connection_mut(existing) {
                for request in idle {
                    connection.send(request)?;
                }
            }
            return Ok(());
        }

        for mut request in idle {
            info!("{origin} alt-svc: sending {} to {alt_origin}", request.uri);
            request.reroute(&alt_origin);
            self.routes.insert(request.id(), alternate);
            if let Some(connection) = pool.connection_mut(alternate) {
                connection.send(request)?;
            }
        }
        Ok(())
    }

    fn on_uncoalesce(&mut self, pool: &mut Pool, existing: ConnectionId, origin: Origin) -> Result<()> {
        let shared = pool
            .connection(existing)
            .is_some_and(|c| c.origins().len() > 1 && c.origins().contains(&origin));
        if !shared {
            debug!("{existing}: nothing to uncoalesce for {origin}");
            return Ok(());
        }
        info!("{origin}: uncoalescing from {existing}");
        let split = pool.init_connection(origin.clone(), self.options.clone())?;
        self.touch(split);
        for id in pool.unmerge(existing, &origin, split)? {
            self.routes.insert(id, split);
        }
        Ok(())
    }
}

impl EventHandler for Dispatcher {
    fn on_event(&mut self, pool: &mut Pool, connection: ConnectionId, event: ConnectionEvent) -> Result<()> {
        match event {
            ConnectionEvent::Response { request } => {
                debug!("{connection}: response for {request}");
                Ok(())
            }
            ConnectionEvent::AltSvc {
                alt_origin,
                origin,
                params,
            } => self.on_altsvc(pool, connection, alt_origin, origin, params),
            ConnectionEvent::Uncoalesce { origin } => self.on_uncoalesce(pool, connection, origin),
            ConnectionEvent::Promise { channel, stream_id } => {
                warn!("{stream_id}: refusing stream!");
                if let Some(conn) = pool.connection_mut(connection) {
                    conn.refuse_push(channel, stream_id);
                }
                self.stats.refused_pushes += 1;
                Ok(())
            }
            ConnectionEvent::Open { channel } => {
                debug!("{connection}: channel {channel} open");
                self.stats.connections_opened += 1;
                Ok(())
            }
            ConnectionEvent::Pong => {
                self.stats.pings += 1;
                Ok(())
            }
            ConnectionEvent::Exhausted { channel } => {
                debug!("{connection}: channel {channel} exhausted");
                self.stats.exhausted += 1;
                Ok(())
            }
        }
    }
}
