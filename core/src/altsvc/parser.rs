//! Alt-Svc header decoding.
//!
//! `h2=":443"; ma=3600, h2="alt.example.com:443"` decodes into one directive
//! per comma-separated entry. Directives without a `protocol=authority` pair,
//! or with an unparsable port, are skipped and the rest of the header is
//! still decoded.

use std::collections::BTreeMap;

use log::debug;

use crate::http::{Request, Response, ALT_SVC};
use crate::origin::{default_port, Origin};

/// One alternative service advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvcDirective {
    /// ALPN protocol id, used as the alternate origin's scheme.
    pub protocol: String,
    /// `None` when the authority was only `:port`.
    pub host: Option<String>,
    pub port: u16,
    pub params: BTreeMap<String, String>,
}

impl AltSvcDirective {
    /// Alternate origin, inheriting `default_host` when the authority omitted it.
    pub fn origin(&self, default_host: &str) -> Origin {
        let host = self.host.as_deref().unwrap_or(default_host);
        Origin::new(&self.protocol, host, self.port)
    }
}

/// Iterator over the directives of one header value.
///
/// Every call to [`parse`] starts from the beginning; cloning the iterator
/// gives an independent cursor.
#[derive(Debug, Clone)]
pub struct AltSvcDirectives<'a> {
    rest: &'a str,
}

/// Decode an Alt-Svc header value.
pub fn parse(header: &str) -> AltSvcDirectives<'_> {
    let rest = header.trim();
    let rest = if rest.eq_ignore_ascii_case("clear") { "" } else { rest };
    AltSvcDirectives { rest }
}

impl Iterator for AltSvcDirectives<'_> {
    type Item = AltSvcDirective;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.rest.is_empty() {
            let (directive, tail) = split_unquoted(self.rest, ',');
            self.rest = tail.unwrap_or("");
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }
            match parse_directive(directive) {
                Some(parsed) => return Some(parsed),
                None => debug!("skipping malformed alt-svc directive {directive:?}"),
            }
        }
        None
    }
}

/// Directives of `response`'s Alt-Svc header as
/// `(alternate origin, advertising origin, params)`; alternates with no host
/// inherit the request's host.
pub fn advertisements(
    request: &Request,
    response: &Response,
) -> Vec<(Origin, Origin, BTreeMap<String, String>)> {
    let Some(header) = response.header(ALT_SVC) else {
        return Vec::new();
    };
    let origin = request.origin();
    parse(header)
        .map(|directive| (directive.origin(&origin.host), origin.clone(), directive.params))
        .collect()
}

fn parse_directive(directive: &str) -> Option<AltSvcDirective> {
    let (alternative, params) = split_unquoted(directive, ';');
    let (protocol, authority) = alternative.split_once('=')?;
    let protocol = protocol.trim();
    if protocol.is_empty() {
        return None;
    }
    let (host, port) = parse_authority(unquote(authority.trim()), protocol)?;

    let mut parsed = BTreeMap::new();
    let mut rest = params;
    while let Some(segment) = rest {
        let (param, tail) = split_unquoted(segment, ';');
        rest = tail;
        if let Some((key, value)) = param.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                parsed.insert(key.to_ascii_lowercase(), unquote(value.trim()).to_string());
            }
        }
    }

    Some(AltSvcDirective {
        protocol: protocol.to_ascii_lowercase(),
        host,
        port,
        params: parsed,
    })
}

fn parse_authority(authority: &str, protocol: &str) -> Option<(Option<String>, u16)> {
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(port) => port.trim().parse().ok()?,
        None => default_port(protocol)?,
    };
    let host = host.trim();
    let host = (!host.is_empty()).then(|| host.to_string());
    Some((host, port))
}

/// Split at the first `sep` that is not inside a quoted string.
fn split_unquoted(s: &str, sep: char) -> (&str, Option<&str>) {
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => return (&s[..i], Some(&s[i + c.len_utf8()..])),
            _ => {}
        }
    }
    (s, None)
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;

    #[test]
    fn parses_quoted_host_and_port_with_max_age() {
        let directives: Vec<_> = parse(r#"h2="alt.example.com:443"; ma=3600"#).collect();
        assert_eq!(directives.len(), 1);
        let d = &directives[0];
        assert_eq!(d.protocol, "h2");
        assert_eq!(d.host.as_deref(), Some("alt.example.com"));
        assert_eq!(d.port, 443);
        assert_eq!(d.params.get("ma").map(String::as_str), Some("3600"));
    }

    #[test]
    fn port_only_authority_inherits_host() {
        let d = parse(r#"h2=":443""#).next().unwrap();
        assert_eq!(d.host, None);
        assert_eq!(d.origin("example.com"), Origin::new("h2", "example.com", 443));
    }

    #[test]
    fn multiple_directives_in_order() {
        let header = r#"h2=":443"; ma=3600, h2="alt.example.com:443""#;
        let hosts: Vec<_> = parse(header).map(|d| d.host).collect();
        assert_eq!(hosts, vec![None, Some("alt.example.com".to_string())]);
    }

    #[test]
    fn each_parse_call_restarts() {
        let header = r#"h2=":443", h2=":8443""#;
        let mut first = parse(header);
        first.next();
        let snapshot = first.clone();
        assert_eq!(first.count(), 1);
        assert_eq!(snapshot.count(), 1);
        assert_eq!(parse(header).count(), 2);
    }

    #[test]
    fn malformed_directive_is_skipped() {
        let header = r#"garbage, h2="alt.example.com:443", h2="x:notaport""#;
        let directives: Vec<_> = parse(header).collect();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].host.as_deref(), Some("alt.example.com"));
    }

    #[test]
    fn clear_yields_nothing() {
        assert_eq!(parse("clear").count(), 0);
        assert_eq!(parse("").count(), 0);
    }

    #[test]
    fn comma_inside_quotes_does_not_split() {
        let d = parse(r#"h2=":443"; persist="a,b""#).next().unwrap();
        assert_eq!(d.params.get("persist").map(String::as_str), Some("a,b"));
    }

    #[test]
    fn ipv6_authority() {
        let d = parse(r#"h2="[2001:db8::1]:8443""#).next().unwrap();
        assert_eq!(d.host.as_deref(), Some("2001:db8::1"));
        assert_eq!(d.port, 8443);
    }

    #[test]
    fn missing_port_falls_back_to_scheme_default() {
        let d = parse(r#"h2="alt.example.com""#).next().unwrap();
        assert_eq!(d.port, 443);
    }

    #[test]
    fn advertisements_use_request_origin() {
        let req = Request::new(HttpMethod::Get, "https://example.com/a").unwrap();
        let res = Response::new(200).with_header("Alt-Svc", r#"h2=":443"; ma=60"#);
        let ads = advertisements(&req, &res);
        assert_eq!(ads.len(), 1);
        let (alt, origin, params) = &ads[0];
        assert_eq!(alt, &Origin::new("h2", "example.com", 443));
        assert_eq!(origin, &Origin::new("https", "example.com", 443));
        assert_eq!(params.get("ma").map(String::as_str), Some("60"));

        assert!(advertisements(&req, &Response::new(200)).is_empty());
    }
}
