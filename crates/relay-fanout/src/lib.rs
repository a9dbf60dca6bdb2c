//! # relay-fanout
//!
//! Republishes packets from the notification channel to browser clients.
//! Each websocket connection is admitted once against the session store and
//! then receives broadcasts plus anything directed at its token.

pub mod error;
pub mod registry;
pub mod server;
pub mod service;

pub use error::{FanoutError, Result};
pub use registry::{Session, SessionRegistry};
pub use server::{build_router, relay_notifications, run_fanout, AppState};
pub use service::{ClientCommand, FanoutService, Outbound};
