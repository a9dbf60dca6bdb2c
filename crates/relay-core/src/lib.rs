//! # relay-core
//!
//! The event model shared by every process: kind classification and parent
//! rules, the per-variant field allow-lists, derived row columns, redaction of
//! invocation arguments, and the notification packets sent to the fan-out.

pub mod columns;
pub mod events;
pub mod fields;
pub mod ids;
pub mod notification;
pub mod redact;

pub use events::{AnchorKind, EventKind, ParentRule};
pub use fields::{Fields, InboundEvent};
pub use ids::{AdHocCommandId, ConnectionId, EventOwner, EventRowId, JobId, SessionId};
pub use notification::{ClientPacket, Delivery, NotificationPacket};
pub use redact::Verbosity;
