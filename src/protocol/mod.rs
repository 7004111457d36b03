//! Memcached ASCII protocol implementation

pub mod command;
pub mod parser;
pub mod response;

pub use command::{Command, MAX_KEY_LENGTH, MAX_VALUE_LENGTH, StoreVerb};
pub use parser::{MAX_LINE_LENGTH, ParseResult, parse};
pub use response::ResponseWriter;
