// Wire protocols: daemon WebSocket frames and the shim's local JSON-RPC lines.

pub mod jsonrpc;
pub mod ws;
