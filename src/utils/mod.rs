//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::{CommandId, CompletionMap, MarkOutcome};
pub use error::LoadError;
pub use print::{logger_init, ME};

pub(crate) use safetcp::{safe_tcp_read_frame, tcp_connect_with_retry};
