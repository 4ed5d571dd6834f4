// conclave-daemon library: the WebSocket tool daemon and its collaborators.

pub mod config;
pub mod error;
pub mod expert;
pub mod provider;
pub mod runtime;
pub mod server;
pub mod session;
pub mod startup;
pub mod tools;
pub mod workflow;
