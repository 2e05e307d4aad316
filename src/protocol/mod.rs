//! RESP protocol support for the client side: reply parsing and command encoding.

pub mod parser;
pub mod types;

pub use parser::Parser;
pub use types::{RespValue, encode_command};
