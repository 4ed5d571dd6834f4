// Sessions: one per live connection, each tracking its in-flight calls.

mod call;
mod registry;

pub use call::{CallHandle, CallStatus};
pub use registry::{
    BeginCallError, CallSnapshot, Registration, SessionKey, SessionRegistry, SessionSnapshot,
};
