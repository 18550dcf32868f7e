//! RESP wire protocol
//!
//! Clients and peers both speak RESP2: requests arrive as arrays of bulk
//! strings, replies go out as simple strings, errors, integers, bulk
//! strings, or arrays. Binary payloads (including replicated log entry
//! data) ride in bulk strings unmodified.

mod encoder;
mod frame;
mod parser;

pub use encoder::encode_frame;
pub use frame::Frame;
pub use parser::{parse_frame, ParseError};
