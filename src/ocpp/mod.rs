//! OCPP 1.6-J wire layer.
//!
//! - [`frame`]: the version-agnostic OCPP-J transport envelope
//!   (Call / CallResult / CallError arrays).
//! - [`types`]: shared OCPP 1.6 enumerations and compound types.
//! - [`messages`]: request/response payloads for the message subset the
//!   simulator speaks.

pub mod frame;
pub mod messages;
pub mod types;

pub use frame::OcppFrame;
