use std::fmt;
use std::str::FromStr;

use http::uri::{Authority, Scheme};
use http::Uri;

/// The target of a request could not be resolved.
///
/// Usually, this means that the URI is missing a scheme or authority,
/// but it can also mean that the connection string could not be parsed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TargetError {
    /// The connection string could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The URI is missing a scheme.
    #[error("missing scheme in uri: {0}")]
    MissingScheme(Uri),

    /// Neither the URI nor the `Host` header name an authority.
    #[error("missing authority in uri: {0}")]
    MissingAuthority(Uri),

    /// No port was given and the scheme has no well-known default.
    #[error("no port given for scheme {0}")]
    UnknownPort(Scheme),
}

impl From<http::uri::InvalidUri> for TargetError {
    fn from(error: http::uri::InvalidUri) -> Self {
        TargetError::InvalidUri(error.to_string())
    }
}

/// A logical destination: scheme, host and port.
///
/// Targets are the connection pool's routing key. Scheme and host compare
/// case-insensitively; both are normalised to lower case on construction,
/// and a missing port is filled in from the scheme.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl Target {
    /// Build a target, defaulting the port from the scheme.
    pub fn new(scheme: Scheme, host: &str, port: Option<u16>) -> Result<Self, TargetError> {
        let scheme = normalize_scheme(scheme);
        let port = match port {
            Some(port) => port,
            None => default_port(&scheme).ok_or_else(|| TargetError::UnknownPort(scheme.clone()))?,
        };

        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Resolve the target of an absolute URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, TargetError> {
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| TargetError::MissingScheme(uri.clone()))?;
        let authority = uri
            .authority()
            .ok_or_else(|| TargetError::MissingAuthority(uri.clone()))?;
        Self::from_authority(scheme, authority)
    }

    fn from_authority(scheme: Scheme, authority: &Authority) -> Result<Self, TargetError> {
        Self::new(scheme, authority.host(), authority.port_u16())
    }

    /// The URI scheme, in lower case.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The host name or address literal, in lower case.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, explicit or defaulted from the scheme.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Does connecting to this target require TLS?
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// The host and port used to open a socket, with IPv6 brackets removed.
    pub fn address(&self) -> (&str, u16) {
        (
            self.host.trim_start_matches('[').trim_end_matches(']'),
            self.port,
        )
    }
}

fn normalize_scheme(scheme: Scheme) -> Scheme {
    if scheme.as_str().bytes().any(|b| b.is_ascii_uppercase()) {
        scheme
            .as_str()
            .to_ascii_lowercase()
            .parse()
            .unwrap_or(scheme)
    } else {
        scheme
    }
}

fn default_port(scheme: &Scheme) -> Option<u16> {
    if *scheme == Scheme::HTTP {
        Some(80)
    } else if *scheme == Scheme::HTTPS {
        Some(443)
    } else {
        None
    }
}

impl TryFrom<&Uri> for Target {
    type Error = TargetError;

    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        Self::from_uri(uri)
    }
}

impl TryFrom<&http::request::Parts> for Target {
    type Error = TargetError;

    /// Resolve the target of a request, falling back to the `Host` header for
    /// requests in origin form. A missing scheme defaults to `http`.
    fn try_from(parts: &http::request::Parts) -> Result<Self, Self::Error> {
        let scheme = parts.uri.scheme().cloned().unwrap_or(Scheme::HTTP);

        if let Some(authority) = parts.uri.authority() {
            return Self::from_authority(scheme, authority);
        }

        let authority = parts
            .headers
            .get(http::header::HOST)
            .and_then(|host| host.to_str().ok())
            .and_then(|host| host.parse::<Authority>().ok())
            .ok_or_else(|| TargetError::MissingAuthority(parts.uri.clone()))?;

        Self::from_authority(scheme, &authority)
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = Uri::from_str(s)?;
        Self::from_uri(&uri)
    }
}
