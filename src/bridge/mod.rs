//! Adapters between tokio and hyper.

pub mod io;

pub use self::io::HyperIo;
