//! Switchyard
//!
//! The client core of an HTTP toolkit: binds logical request/response exchanges
//! to pooled physical connections, negotiates HTTP/1.1 or HTTP/2 for each
//! connection, and multiplexes many concurrent exchanges over a single
//! HTTP/2 connection with per-stream and per-connection flow control.
//!
//! The entry point is the [`Requester`], which leases sessions from a
//! [`pool::Pool`] and hands [exchange handlers](exchange::ExchangeHandler)
//! to them as commands.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod bridge;
pub mod cancel;
pub mod conn;
mod error;
pub mod exchange;
pub mod h1;
pub mod h2;
pub mod info;
pub mod pool;
pub mod requester;
pub mod session;
mod target;
pub mod version;

pub use self::cancel::{Cancellable, CancellableHandle};
pub use self::error::{Error, ErrorKind};
pub use self::requester::Requester;
pub use self::target::{Target, TargetError};
pub use self::version::VersionPolicy;

/// Boxed error type used for transports, TLS strategies and handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
