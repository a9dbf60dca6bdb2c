//! # relay-dispatch
//!
//! The receiving half of the event pipeline. A single [`Dispatcher`] reads every
//! callback message, persists structural anchors inline so parent links always
//! resolve, and hands everything else to a supervised [`WorkerPool`].

pub mod anchors;
pub mod dispatcher;
pub mod error;
pub mod facts;
pub mod notifier;
pub mod persist;
pub mod pool;
mod worker;

pub use anchors::AnchorTable;
pub use dispatcher::{run_dispatcher, Dispatcher, Handled};
pub use error::DispatchError;
pub use facts::{run_fact_receiver, FactMessage, FactReceiver};
pub use notifier::{Notifier, NotifyTarget};
pub use persist::persist_event;
pub use pool::{PoolConfig, WorkItem, WorkerPool};
pub use worker::WorkerExit;
