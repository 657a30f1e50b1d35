pub mod connection;
pub mod session;

pub use connection::{ConnectionState, ConnectionTracker, ConnectionTransition, FailureReason};
pub use session::{LifecycleTransition, SessionState};
