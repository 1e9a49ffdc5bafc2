//! The HTTP/2 frame model exchanged with a [`FrameCodec`](super::FrameCodec).
//!
//! Frames here carry decoded header blocks; HPACK and the byte-level framing
//! live in the codec.

use std::fmt;

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, Method, StatusCode};

use crate::Error;

/// A stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    /// The connection control stream.
    pub const ZERO: StreamId = StreamId(0);

    /// The largest valid stream identifier.
    pub const MAX: StreamId = StreamId(0x7fff_ffff);

    /// The first identifier a client may use.
    pub const FIRST_CLIENT: StreamId = StreamId(1);

    /// Wrap a raw identifier. The reserved high bit is cleared.
    pub const fn new(id: u32) -> Self {
        StreamId(id & 0x7fff_ffff)
    }

    /// The raw identifier.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Is this the connection control stream?
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Client-initiated streams have odd identifiers.
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Server-initiated (pushed) streams have even, non-zero identifiers.
    pub fn is_server_initiated(&self) -> bool {
        !self.is_zero() && self.0 % 2 == 0
    }

    /// The next identifier of the same parity, if one remains.
    pub fn next(&self) -> Option<StreamId> {
        self.0
            .checked_add(2)
            .filter(|next| *next <= Self::MAX.0)
            .map(StreamId)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<StreamId> for u32 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// An HTTP/2 error code, carried by RST_STREAM and GOAWAY.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reason(u32);

impl Reason {
    /// Graceful shutdown.
    pub const NO_ERROR: Reason = Reason(0x0);
    /// Unspecific protocol violation.
    pub const PROTOCOL_ERROR: Reason = Reason(0x1);
    /// Unexpected internal error.
    pub const INTERNAL_ERROR: Reason = Reason(0x2);
    /// Flow-control protocol violation.
    pub const FLOW_CONTROL_ERROR: Reason = Reason(0x3);
    /// Settings were not acknowledged in time.
    pub const SETTINGS_TIMEOUT: Reason = Reason(0x4);
    /// Frame received on a half-closed stream.
    pub const STREAM_CLOSED: Reason = Reason(0x5);
    /// Frame with an invalid size.
    pub const FRAME_SIZE_ERROR: Reason = Reason(0x6);
    /// Stream refused before any processing.
    pub const REFUSED_STREAM: Reason = Reason(0x7);
    /// Stream no longer needed.
    pub const CANCEL: Reason = Reason(0x8);
    /// Header compression state could not be maintained.
    pub const COMPRESSION_ERROR: Reason = Reason(0x9);
    /// CONNECT tunnel was reset.
    pub const CONNECT_ERROR: Reason = Reason(0xa);
    /// Peer is generating excessive load.
    pub const ENHANCE_YOUR_CALM: Reason = Reason(0xb);
    /// Transport security is inadequate.
    pub const INADEQUATE_SECURITY: Reason = Reason(0xc);
    /// HTTP/1.1 is required instead.
    pub const HTTP_1_1_REQUIRED: Reason = Reason(0xd);

    /// The numeric error code.
    pub fn code(&self) -> u32 {
        self.0
    }

    fn name(&self) -> Option<&'static str> {
        Some(match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        })
    }
}

impl From<u32> for Reason {
    fn from(code: u32) -> Self {
        Reason(code)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown error code {:#x}", self.0),
        }
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => f.debug_tuple("Reason").field(&self.0).finish(),
        }
    }
}

/// SETTINGS parameters. Only the parameters present on the wire are `Some`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE
    pub header_table_size: Option<u32>,
    /// SETTINGS_ENABLE_PUSH
    pub enable_push: Option<bool>,
    /// SETTINGS_MAX_CONCURRENT_STREAMS
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE
    pub initial_window_size: Option<u32>,
    /// SETTINGS_MAX_FRAME_SIZE
    pub max_frame_size: Option<u32>,
    /// SETTINGS_MAX_HEADER_LIST_SIZE
    pub max_header_list_size: Option<u32>,
}

/// Pseudo-header fields of a header block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pseudo {
    /// `:method`
    pub method: Option<Method>,
    /// `:scheme`
    pub scheme: Option<Scheme>,
    /// `:authority`
    pub authority: Option<Authority>,
    /// `:path`
    pub path: Option<PathAndQuery>,
    /// `:status`
    pub status: Option<StatusCode>,
}

/// A decoded header block: pseudo-headers plus regular fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBlock {
    /// Pseudo-header fields.
    pub pseudo: Pseudo,
    /// Regular header fields.
    pub fields: HeaderMap,
}

const CONNECTION_SPECIFIC: [HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    HeaderName::from_static("keep-alive"),
];

impl HeaderBlock {
    /// Build the header block for a request.
    ///
    /// Connection-specific fields are removed; the `Host` header becomes the
    /// `:authority` when the URI has none.
    pub fn request(parts: &http::request::Parts) -> Result<Self, Error> {
        let mut fields = parts.headers.clone();
        let host = fields
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .and_then(|host| host.parse::<Authority>().ok());

        for name in CONNECTION_SPECIFIC.iter() {
            fields.remove(name);
        }
        fields.remove("proxy-connection");
        if fields
            .get(header::TE)
            .is_some_and(|te| te.as_bytes() != b"trailers")
        {
            fields.remove(header::TE);
        }

        let authority = parts.uri.authority().cloned().or(host);

        let pseudo = if parts.method == Method::CONNECT {
            Pseudo {
                method: Some(Method::CONNECT),
                authority: Some(
                    authority.ok_or_else(|| Error::protocol("CONNECT request without authority"))?,
                ),
                ..Default::default()
            }
        } else {
            Pseudo {
                method: Some(parts.method.clone()),
                scheme: Some(parts.uri.scheme().cloned().unwrap_or(Scheme::HTTP)),
                authority,
                path: Some(
                    parts
                        .uri
                        .path_and_query()
                        .cloned()
                        .unwrap_or_else(|| PathAndQuery::from_static("/")),
                ),
                status: None,
            }
        };

        Ok(Self { pseudo, fields })
    }

    /// Build a response header block.
    pub fn response(status: StatusCode, fields: HeaderMap) -> Self {
        Self {
            pseudo: Pseudo {
                status: Some(status),
                ..Default::default()
            },
            fields,
        }
    }

    /// Build a trailer block.
    pub fn trailers(fields: HeaderMap) -> Self {
        Self {
            pseudo: Pseudo::default(),
            fields,
        }
    }

    /// Does this block carry a `:status`?
    pub fn is_response(&self) -> bool {
        self.pseudo.status.is_some()
    }

    /// Convert a response block into response parts.
    pub fn into_response(self) -> Result<http::response::Parts, Error> {
        let status = self
            .pseudo
            .status
            .ok_or_else(|| Error::protocol("response header block without :status"))?;

        let (mut parts, _) = http::Response::new(()).into_parts();
        parts.status = status;
        parts.version = http::Version::HTTP_2;
        parts.headers = self.fields;
        Ok(parts)
    }

    /// Convert a request block (e.g. a push promise) into request parts.
    pub fn into_request(self) -> Result<http::request::Parts, Error> {
        let Pseudo {
            method,
            scheme,
            authority,
            path,
            ..
        } = self.pseudo;

        let method = method.ok_or_else(|| Error::protocol("request header block without :method"))?;
        let mut uri = http::Uri::builder();
        if let Some(scheme) = scheme {
            uri = uri.scheme(scheme);
        }
        if let Some(authority) = authority {
            uri = uri.authority(authority);
        }
        uri = uri.path_and_query(path.ok_or_else(|| Error::protocol("request header block without :path"))?);

        let (mut parts, _) = http::Request::new(()).into_parts();
        parts.method = method;
        parts.uri = uri
            .build()
            .map_err(|error| Error::protocol(format!("invalid request uri: {error}")))?;
        parts.version = http::Version::HTTP_2;
        parts.headers = self.fields;
        Ok(parts)
    }
}

/// An HTTP/2 frame.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Frame {
    /// HEADERS (with any CONTINUATION frames already joined).
    Headers {
        /// Stream the block belongs to.
        stream_id: StreamId,
        /// The decoded header block.
        block: HeaderBlock,
        /// END_STREAM flag.
        end_stream: bool,
    },

    /// DATA
    Data {
        /// Stream the payload belongs to.
        stream_id: StreamId,
        /// Payload, without padding.
        payload: Bytes,
        /// END_STREAM flag.
        end_stream: bool,
    },

    /// RST_STREAM
    Reset {
        /// Stream being reset.
        stream_id: StreamId,
        /// Why.
        reason: Reason,
    },

    /// SETTINGS
    Settings {
        /// ACK flag.
        ack: bool,
        /// Parameters (empty for an acknowledgement).
        settings: Settings,
    },

    /// PUSH_PROMISE
    PushPromise {
        /// Stream the promise is associated with.
        stream_id: StreamId,
        /// Stream reserved for the pushed response.
        promised_id: StreamId,
        /// The promised request.
        block: HeaderBlock,
    },

    /// PING
    Ping {
        /// ACK flag.
        ack: bool,
        /// Opaque data echoed by the peer.
        payload: [u8; 8],
    },

    /// GOAWAY
    GoAway {
        /// Highest stream the sender may have processed.
        last_stream_id: StreamId,
        /// Why.
        reason: Reason,
        /// Opaque diagnostic data.
        debug_data: Bytes,
    },

    /// WINDOW_UPDATE
    WindowUpdate {
        /// Stream receiving credit, or zero for the connection.
        stream_id: StreamId,
        /// Credit granted.
        increment: u32,
    },
}

impl Frame {
    /// The stream this frame belongs to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Headers { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Reset { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => StreamId::ZERO,
        }
    }

    /// Frame type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Headers { .. } => "HEADERS",
            Frame::Data { .. } => "DATA",
            Frame::Reset { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::PushPromise { .. } => "PUSH_PROMISE",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
        }
    }
}
