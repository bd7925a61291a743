//! Hadron replica: the store acknowledgment path of a replicated log storage node.
//!
//! Storage nodes acknowledge every store with a STORED reply. This crate implements the reply's
//! wire codec, its dispatch to the appender or rebuilding which issued the store, and the routing
//! of outbound replies to the worker owning the connection they must go out on.

pub mod app;
pub mod appender;
pub mod config;
pub mod error;
pub mod processor;
pub mod protocol;
pub mod ratelimit;
pub mod rebuilding;
pub mod sender;
pub mod server;
pub mod stats;
pub mod stored;
pub mod types;
pub mod worker;

pub use crate::app::App;
pub use crate::config::Config;
