//! Connection options for backend endpoints.
//!
//! Dial options travel with a service's configuration untouched until the
//! controller asks for a transport endpoint; malformed values are reported
//! then, not when the agent is built.

use std::time::Duration;

use thiserror::Error;
use tonic::transport::Endpoint;

/// Errors raised while turning an endpoint string and its options into a
/// transport endpoint.
#[derive(Debug, Error)]
pub enum DialError {
    /// The endpoint string is not a valid URI.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The user agent is not a valid header value.
    #[error("invalid user agent {0:?}")]
    InvalidUserAgent(String),
}

/// A single connection option for a backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOption {
    /// Timeout for establishing the connection.
    ConnectTimeout(Duration),

    /// Per-request timeout.
    Timeout(Duration),

    /// TCP keepalive interval.
    TcpKeepalive(Duration),

    /// HTTP/2 keepalive ping interval.
    Http2KeepAliveInterval(Duration),

    /// Keep pinging while the connection is idle.
    KeepAliveWhileIdle(bool),

    /// Maximum in-flight requests on the connection.
    ConcurrencyLimit(usize),

    /// User agent sent with every request.
    UserAgent(String),
}

impl DialOption {
    fn apply(&self, endpoint: Endpoint) -> Result<Endpoint, DialError> {
        let endpoint = match self {
            DialOption::ConnectTimeout(d) => endpoint.connect_timeout(*d),
            DialOption::Timeout(d) => endpoint.timeout(*d),
            DialOption::TcpKeepalive(d) => endpoint.tcp_keepalive(Some(*d)),
            DialOption::Http2KeepAliveInterval(d) => endpoint.http2_keep_alive_interval(*d),
            DialOption::KeepAliveWhileIdle(on) => endpoint.keep_alive_while_idle(*on),
            DialOption::ConcurrencyLimit(n) => endpoint.concurrency_limit(*n),
            DialOption::UserAgent(ua) => endpoint
                .user_agent(ua.clone())
                .map_err(|_| DialError::InvalidUserAgent(ua.clone()))?,
        };
        Ok(endpoint)
    }
}

/// Build a transport endpoint from an endpoint string and dial options.
///
/// Bare `host:port` endpoints are dialed over plain `http://`. Options are
/// applied in order, so later options win.
pub fn endpoint(target: &str, options: &[DialOption]) -> Result<Endpoint, DialError> {
    let uri = if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{target}")
    };

    let endpoint =
        Endpoint::from_shared(uri).map_err(|e| DialError::InvalidEndpoint {
            endpoint: target.to_string(),
            reason: e.to_string(),
        })?;

    options
        .iter()
        .try_fold(endpoint, |endpoint, opt| opt.apply(endpoint))
}
