//! Byte-level transports underneath an MCP client session.

pub mod http;
pub mod stdio;
