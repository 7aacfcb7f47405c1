//! Client configuration.

use crate::DatabaseError;

/// Port used when the endpoint string carries no `:port` suffix.
pub const DEFAULT_PORT: u16 = 4662;

/// Plain configuration record for a [`SqlitStorage`](crate::SqlitStorage).
///
/// There are no environment variables and no config files; the embedder
/// constructs this directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlitConfig {
    /// `host:port` of the server. The port defaults to
    /// [`DEFAULT_PORT`] when omitted.
    pub endpoint: String,
    /// Logical database identifier sent on every request.
    pub database_id: String,
    /// Maximum number of concurrent connections.
    pub pool_size: usize,
    /// Per-exchange timeout. `0` disables the deadline.
    pub timeout_ms: u64,
}

impl Default for SqlitConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("localhost:{DEFAULT_PORT}"),
            database_id: String::new(),
            pool_size: 5,
            timeout_ms: 30_000,
        }
    }
}

/// Split an endpoint string into `(host, port)`.
///
/// The split happens on the *last* colon so that already-normalized
/// host forms pass through. Bracketed IPv6 literals (`[::1]:4662`) are
/// accepted and unwrapped; unbracketed IPv6 literals are rejected
/// because the last-colon rule cannot parse them unambiguously.
///
/// # Errors
///
/// * If the host is empty, the port is not a valid `u16`, or the host
///   is an unbracketed IPv6 literal
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), DatabaseError> {
    let invalid = || DatabaseError::InvalidEndpoint(endpoint.to_string());

    let (raw_host, port) = if endpoint.ends_with(']') {
        (endpoint, DEFAULT_PORT)
    } else {
        match endpoint.rfind(':') {
            Some(index) => {
                let port = endpoint[index + 1..].parse::<u16>().map_err(|_| invalid())?;
                (&endpoint[..index], port)
            }
            None => (endpoint, DEFAULT_PORT),
        }
    };

    let bracketed = raw_host.starts_with('[') && raw_host.ends_with(']');
    let host = if bracketed {
        &raw_host[1..raw_host.len() - 1]
    } else {
        raw_host
    };

    if host.is_empty() || (!bracketed && host.contains(':')) {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}
