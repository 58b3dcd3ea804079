//! Per-instance request rewriting and forwarding.
//!
//! Each inbound request is rewritten against the service's configured
//! target (scheme and authority from the target, path and query from the
//! request) and handed to the forwarding engine. The response is copied
//! back with hop-by-hop headers filtered.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response};
use thiserror::Error;
use url::Url;

use crate::config::ServiceSpec;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Outcome of rewriting one inbound request. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    /// Fully resolved outbound URL.
    pub url: Url,
    /// Host header to assert toward the backend; `None` lets the
    /// forwarding engine derive it from the URL authority.
    pub host_header: Option<String>,
}

/// Headers that only make sense on a single hop.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Caller-supplied forwarding metadata, overwritten unless trusted.
fn is_forward_header(name: &str) -> bool {
    matches!(
        name,
        "forwarded" | "x-forwarded-for" | "x-forwarded-host" | "x-forwarded-proto"
    )
}

/// Rewrites inbound requests and forwards them to the backend.
pub struct RequestForwarder {
    target: String,
    pass_host_header: bool,
    trust_forward_header: bool,
    /// Hostname this node is reachable as: the first TLS-certified
    /// domain when the tailnet reports one, otherwise the node name.
    canonical_host: String,
    client: reqwest::Client,
}

impl RequestForwarder {
    pub fn new(spec: &ServiceSpec, canonical_host: String) -> Self {
        Self {
            target: spec.target_str(),
            pass_host_header: spec.pass_host_header,
            trust_forward_header: spec.trust_forward_header,
            canonical_host,
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(10)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    pub fn canonical_host(&self) -> &str {
        &self.canonical_host
    }

    /// Derive the outbound URL and Host header for one inbound request.
    ///
    /// The target contributes scheme and authority only; a stored path or
    /// query on the target is discarded. A target without a scheme gets
    /// `http`.
    pub fn rewrite(
        &self,
        path: &str,
        query: Option<&str>,
        inbound_host: Option<&str>,
    ) -> Result<RewriteResult, RewriteError> {
        let raw = self.target.trim();
        if raw.is_empty() {
            return Err(RewriteError::InvalidTarget {
                target: self.target.clone(),
                reason: "target is empty".to_string(),
            });
        }

        // `localhost:8080` would parse with scheme "localhost"; only a
        // real scheme separator counts.
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let mut url = Url::parse(&with_scheme).map_err(|e| RewriteError::InvalidTarget {
            target: self.target.clone(),
            reason: e.to_string(),
        })?;

        if !url.has_host() {
            return Err(RewriteError::InvalidTarget {
                target: self.target.clone(),
                reason: "target has no host".to_string(),
            });
        }

        url.set_path(path);
        url.set_query(query);
        url.set_fragment(None);

        let host_header = if self.pass_host_header {
            inbound_host.map(str::to_string)
        } else {
            None
        };

        Ok(RewriteResult { url, host_header })
    }

    /// Forward one inbound request and copy the response back.
    pub async fn forward(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, ForwardError> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let inbound_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let rewrite = self.rewrite(&path, query.as_deref(), inbound_host.as_deref())?;

        tracing::debug!(
            method = %req.method(),
            outbound = %rewrite.url,
            "forwarding request"
        );

        let mut outbound = self.client.request(req.method().clone(), rewrite.url.clone());

        let caller_sent_forward_host = req.headers().contains_key("x-forwarded-host");

        for (name, value) in req.headers() {
            let name_str = name.as_str();
            if name_str == "host" || is_hop_by_hop(name_str) {
                continue;
            }
            if !self.trust_forward_header && is_forward_header(name_str) {
                continue;
            }
            outbound = outbound.header(name, value);
        }

        if self.trust_forward_header {
            // Caller headers pass through; advertise the certified
            // hostname only where the caller left a gap.
            if !caller_sent_forward_host {
                outbound = outbound.header("x-forwarded-host", &self.canonical_host);
            }
        } else {
            outbound = outbound
                .header("x-forwarded-proto", "https")
                .header("x-forwarded-host", &self.canonical_host);
        }

        if let Some(host) = rewrite.host_header {
            outbound = outbound.header(HOST, host);
        }

        let body = req.into_body().collect().await?.to_bytes();
        if !body.is_empty() {
            outbound = outbound.body(body);
        }

        let upstream = outbound.send().await?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await?;

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            response.headers_mut().append(name.clone(), value.clone());
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(target: Option<&str>, local_port: Option<u32>) -> RequestForwarder {
        let spec = ServiceSpec {
            node_name: "test".to_string(),
            target: target.map(str::to_string),
            local_port,
            pass_host_header: false,
            trust_forward_header: false,
        };
        RequestForwarder::new(&spec, "test".to_string())
    }

    fn forwarder_passing_host(target: &str) -> RequestForwarder {
        let spec = ServiceSpec {
            node_name: "test".to_string(),
            target: Some(target.to_string()),
            local_port: None,
            pass_host_header: true,
            trust_forward_header: false,
        };
        RequestForwarder::new(&spec, "test".to_string())
    }

    #[test]
    fn test_bare_local_port_target() {
        let fwd = forwarder(None, Some(8080));
        let result = fwd.rewrite("/foo", Some("x=1"), None).unwrap();
        assert_eq!(result.url.as_str(), "http://localhost:8080/foo?x=1");
    }

    #[test]
    fn test_url_target_keeps_scheme_and_authority_only() {
        let fwd = forwarder(Some("http://localhost:8080/stale/path?y=2"), None);
        let result = fwd.rewrite("/foo", Some("x=1"), None).unwrap();
        assert_eq!(result.url.as_str(), "http://localhost:8080/foo?x=1");
    }

    #[test]
    fn test_missing_scheme_defaults_to_http() {
        let fwd = forwarder(Some("example.com:9000"), None);
        let result = fwd.rewrite("/", None, None).unwrap();
        assert_eq!(result.url.scheme(), "http");
        assert_eq!(result.url.host_str(), Some("example.com"));
        assert_eq!(result.url.port(), Some(9000));
    }

    #[test]
    fn test_https_scheme_preserved() {
        let fwd = forwarder(Some("https://api.example.com"), None);
        let result = fwd.rewrite("/v1/thing", Some("k=v"), None).unwrap();
        assert_eq!(result.url.as_str(), "https://api.example.com/v1/thing?k=v");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let fwd = forwarder(Some("http://localhost:8080"), None);
        let first = fwd.rewrite("/foo", Some("x=1"), None).unwrap();
        let again = fwd
            .rewrite(first.url.path(), first.url.query(), None)
            .unwrap();
        assert_eq!(first.url, again.url);
    }

    #[test]
    fn test_empty_target_is_rewrite_error() {
        let fwd = forwarder(None, None);
        assert!(fwd.rewrite("/", None, None).is_err());
    }

    #[test]
    fn test_hostless_target_is_rewrite_error() {
        let fwd = forwarder(Some("http://"), None);
        let err = fwd.rewrite("/", None, None).unwrap_err();
        assert!(err.to_string().contains("http://"));
    }

    #[test]
    fn test_host_header_asserted_by_default() {
        let fwd = forwarder(Some("http://localhost:8080"), None);
        let result = fwd
            .rewrite("/", None, Some("web.example.ts.net"))
            .unwrap();
        assert_eq!(result.host_header, None);
    }

    #[test]
    fn test_host_header_preserved_when_passing() {
        let fwd = forwarder_passing_host("http://localhost:8080");
        let result = fwd
            .rewrite("/", None, Some("web.example.ts.net"))
            .unwrap();
        assert_eq!(result.host_header.as_deref(), Some("web.example.ts.net"));
    }
}
