//! Request and response types carried through the engine.
//!
//! # Design
//! Requests and responses are plain data. Framing them on the wire is the
//! channel's job; the engine only routes them. Headers stay an ordered list
//! of owned pairs, looked up case-insensitively.

use std::fmt;

use url::Url;
use uuid::Uuid;

use crate::error::Result;
use crate::origin::Origin;

/// Header set on a request once it has been rerouted to an Alt-Svc alternate.
pub const ALT_USED: &str = "alt-used";

/// Header carrying alternate-service advertisements on a response.
pub const ALT_SVC: &str = "alt-svc";

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a request across connections and channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued on a connection, not yet handed to a channel.
    Idle,
    /// Handed to a channel; may be on the wire.
    Dispatched,
    /// Pulled off its connection by an Alt-Svc reroute, about to be re-queued.
    Migrated,
    /// Response delivered.
    Completed,
    /// The batch failed before a response arrived.
    Errored,
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    pub method: HttpMethod,
    pub uri: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub state: RequestState,
    origin: Origin,
    alt_target: Option<Origin>,
}

impl Request {
    /// Build a request for an absolute URI.
    pub fn new(method: HttpMethod, uri: &str) -> Result<Self> {
        let uri = Url::parse(uri)?;
        let origin = Origin::from_url(&uri)?;
        Ok(Self {
            id: RequestId::new(),
            method,
            uri,
            headers: Vec::new(),
            body: None,
            state: RequestState::Idle,
            origin,
            alt_target: None,
        })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The origin named by the request URI.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The origin a channel must be bound to: the Alt-Svc alternate once the
    /// request has been rerouted, otherwise the URI's own origin.
    pub fn target(&self) -> &Origin {
        self.alt_target.as_ref().unwrap_or(&self.origin)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether the request has already been sent towards an alternate.
    pub fn uses_alternate(&self) -> bool {
        self.header(ALT_USED).is_some()
    }

    /// Point the request at an alternate service and tag it with `alt-used`.
    pub(crate) fn reroute(&mut self, alternate: &Origin) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(ALT_USED));
        self.headers.push((ALT_USED.to_string(), alternate.authority()));
        self.alt_target = Some(alternate.clone());
        self.state = RequestState::Migrated;
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_derives_origin_from_uri() {
        let req = Request::new(HttpMethod::Get, "https://example.com/a").unwrap();
        assert_eq!(req.origin(), &Origin::new("https", "example.com", 443));
        assert_eq!(req.target(), req.origin());
        assert_eq!(req.state, RequestState::Idle);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = Request::new(HttpMethod::Get, "http://example.com/").unwrap();
        let b = Request::new(HttpMethod::Get, "http://example.com/").unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn relative_uri_is_rejected() {
        assert!(Request::new(HttpMethod::Get, "/index.html").is_err());
    }

    #[test]
    fn reroute_sets_alt_used_once() {
        let mut req = Request::new(HttpMethod::Get, "https://example.com/a").unwrap();
        assert!(!req.uses_alternate());

        let alt = Origin::new("h2", "alt.example.com", 443);
        req.reroute(&alt);
        req.reroute(&alt);

        assert!(req.uses_alternate());
        assert_eq!(req.header("Alt-Used"), Some("alt.example.com:443"));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.target(), &alt);
        assert_eq!(req.origin().host, "example.com");
        assert_eq!(req.state, RequestState::Migrated);
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let res = Response::new(200).with_header("Alt-Svc", "h2=\":443\"");
        assert_eq!(res.header("alt-svc"), Some("h2=\":443\""));
        assert_eq!(res.header("content-type"), None);
    }
}
