//! A framed request/response command protocol.
//!
//! The wire unit is a *box*: length-prefixed key/value pairs ended by a
//! zero length, with keys up to 255 bytes and values up to 65 535
//! bytes. Reserved keys structure call and response:
//!
//! ```text
//! C: _command: Sum
//! C: _ask: 2a
//! C: a: 13
//! C: b: 81
//!
//! S: _answer: 2a
//! S: total: 94
//! ```
//!
//! Commands are declared as static [`Command`] descriptors carrying
//! their typed argument/response schemas and error-code mappings, and
//! are served by responders registered in a [`Dispatcher`]. The
//! [`FramedHandle`] issues calls whose responses arrive as deferreds; a
//! switch responder can replace the protocol mid-stream, handing any
//! trailing bytes to the replacement.

mod boxes;
mod command;
mod proto;
#[cfg(test)]
mod test;

pub use boxes::{BoxParser, CommandBox, MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
pub use command::{ArgKind, ArgList, ArgValue, Command};
pub use proto::{
    ANSWER, ASK, COMMAND, Dispatcher, ERROR, ERROR_CODE, ERROR_DESCRIPTION, FramedHandle,
    FramedProtocol, UNHANDLED_ERROR_CODE, UNKNOWN_ERROR_CODE,
};
