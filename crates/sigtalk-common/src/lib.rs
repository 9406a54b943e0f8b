pub mod diagnostics;
pub mod message_buffer;
pub mod protocol_common;
pub mod session;
