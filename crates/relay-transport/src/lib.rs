//! # relay-transport
//!
//! Synchronous request/reply channels over TCP. A [`Publisher`] sends one
//! length-delimited JSON frame and waits for a single acknowledgment byte
//! before the next send is allowed. A [`Listener`] acknowledges a message only
//! once its caller asks for the next one, so ordering is FIFO per connection.

#![deny(unsafe_code)]

pub mod channel;
pub mod codec;
pub mod error;
pub mod listener;
pub mod publisher;

pub use channel::Channel;
pub use error::{Result, TransportError};
pub use listener::Listener;
pub use publisher::{Publisher, PublisherConfig};
