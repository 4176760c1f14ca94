//! Session-wide owner of connections and driver of the reactor.
//!
//! # Design
//! The pool is driven by one thread at a time. Each tick runs a readiness
//! cycle on every connection with pending work, and hands that connection's
//! events to the caller's [`EventHandler`] before moving to the next one. The
//! handler receives the pool mutably so it can open connections or reroute
//! requests from inside the tick.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info};

use crate::channel::Transport;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, Result};
use crate::http::RequestId;
use crate::options::Options;
use crate::origin::Origin;
use crate::resolver::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receives connection events synchronously during [`Pool::next_tick`].
pub trait EventHandler {
    fn on_event(&mut self, pool: &mut Pool, connection: ConnectionId, event: ConnectionEvent) -> Result<()>;
}

pub struct Pool {
    resolver: Rc<dyn Resolver>,
    transport: Rc<dyn Transport>,
    connections: Vec<(ConnectionId, Connection)>,
    next_id: u64,
}

impl Pool {
    pub fn new(resolver: Rc<dyn Resolver>, transport: Rc<dyn Transport>) -> Self {
        Self {
            resolver,
            transport,
            connections: Vec::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// A connection already able to serve `origin` under `options`. When none
    /// serves it yet, one whose channels already reach the origin's address
    /// adopts it.
    pub fn find_connection(&mut self, origin: &Origin, options: &Options) -> Option<ConnectionId> {
        if let Some((id, _)) = self.connections.iter().find(|(_, c)| c.matches(origin, options)) {
            return Some(*id);
        }
        let (id, connection) = self
            .connections
            .iter_mut()
            .find(|(_, c)| c.can_coalesce(origin, options))?;
        info!("coalescing {origin} into {id}");
        connection.merge_origin(origin.clone());
        Some(*id)
    }

    /// Build and register a connection for `origin`.
    pub fn init_connection(&mut self, origin: Origin, options: Options) -> Result<ConnectionId> {
        let connection = Connection::new(
            origin,
            options,
            Rc::clone(&self.resolver),
            Rc::clone(&self.transport),
        )?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        debug!("{id}: new connection for {:?}", connection.origins());
        self.connections.push((id, connection));
        Ok(id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|(cid, _)| *cid == id).map(|(_, c)| c)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().map(|(_, c)| c)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections
            .iter_mut()
            .find(|(cid, _)| *cid == id)
            .map(|(_, c)| c)
    }

    /// Run one readiness cycle on every connection with pending work.
    pub fn next_tick(&mut self, timeout: Duration, handler: &mut dyn EventHandler) -> Result<()> {
        let busy: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.has_pending_work())
            .map(|(id, _)| *id)
            .collect();

        for id in busy {
            // an earlier handler may have closed it or finished its work
            let Some(connection) = self.connection_mut(id) else {
                continue;
            };
            if !connection.has_pending_work() {
                continue;
            }
            let events = connection.process_events(timeout)?;
            for event in events {
                handler.on_event(self, id, event)?;
            }
        }
        Ok(())
    }

    /// True when no connection has anything queued, unwritten or in flight.
    pub fn is_empty(&self) -> bool {
        self.connections.iter().all(|(_, c)| !c.has_pending_work())
    }

    /// Close and forget the given connections, or all of them.
    pub fn close(&mut self, ids: Option<&[ConnectionId]>) {
        let (closing, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|(id, _)| ids.is_none_or(|ids| ids.contains(id)));
        self.connections = kept;
        for (id, mut connection) in closing {
            debug!("{id}: closing");
            connection.close(None);
        }
    }

    /// Move `origin` from connection `from` to connection `to`. Returns the
    /// ids of idle requests that moved with it.
    pub fn unmerge(&mut self, from: ConnectionId, origin: &Origin, to: ConnectionId) -> Result<Vec<RequestId>> {
        let position = |id| self.connections.iter().position(|(cid, _)| *cid == id);
        let (Some(a), Some(b)) = (position(from), position(to)) else {
            return Err(Error::Usage(format!("cannot move {origin} from {from} to {to}")));
        };
        if a == b {
            return Ok(Vec::new());
        }
        let (source, target) = if a < b {
            let (left, right) = self.connections.split_at_mut(b);
            (&mut left[a].1, &mut right[0].1)
        } else {
            let (left, right) = self.connections.split_at_mut(a);
            (&mut right[0].1, &mut left[b].1)
        };
        source.unmerge(origin, target)
    }
}
