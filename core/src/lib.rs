//! Connection multiplexing and dispatch engine for an HTTP client.
//!
//! # Overview
//! A [`Session`] submits batches of requests and returns their responses in
//! submission order. Underneath, a [`Pool`] owns one [`Connection`] per
//! coalescing group of origins; each connection binds requests to channels
//! keyed by resolved address, so hostnames sharing an address share a
//! channel. The pool drives a cooperative readiness loop over every channel,
//! and Alt-Svc advertisements seen on responses are cached process-wide and
//! used to move still-idle requests to the advertised alternate.
//!
//! # Design
//! - Wire protocols, TLS and DNS are collaborators behind the [`Channel`],
//!   [`Transport`] and [`Resolver`] traits; the engine only routes.
//! - A session is single-threaded. The [`AltSvcCache`] is the only state
//!   shared between sessions, behind one lock.
//! - Events raised by channels are handled synchronously inside the tick
//!   that produced them.

pub mod altsvc;
pub mod channel;
pub mod connection;
pub mod error;
pub mod http;
pub mod options;
pub mod origin;
pub mod pool;
pub mod resolver;
pub mod session;

pub use altsvc::{AltSvcCache, AltSvcEntry};
pub use channel::{Channel, ChannelEvent, ChannelId, ChannelState, Flow, Interest, Readiness, Transport};
pub use connection::{Connection, ConnectionEvent};
pub use error::{Error, Result};
pub use http::{HttpMethod, Request, RequestId, RequestState, Response};
pub use options::{Options, OptionsPatch, Timeouts, TransportKind};
pub use origin::Origin;
pub use pool::{ConnectionId, EventHandler, Pool};
pub use resolver::{DnsResolver, Resolver};
pub use session::{Session, SessionStats};
