//! Log lines and CLI tables

mod formatter;
mod request_log;

pub use formatter::*;
pub use request_log::*;
