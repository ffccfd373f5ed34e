//! Persistent conversation sessions.
//!
//! A [`Session`] is an ordered list of [`Message`]s plus metadata. It only
//! grows by appending, except for the explicit [`Session::rewind`] and
//! [`Session::compress`] operations. [`SessionStore`] keeps one JSON file
//! per session and never touches a file it fails to parse.

#[macro_use]
extern crate tracing;

mod error;
mod message;
mod session;
mod store;

pub use error::SessionError;
pub use message::{Content, Message, Role};
pub use session::{Session, SessionMetadata, UsageCounters};
pub use store::{SessionStore, SessionSummary};
