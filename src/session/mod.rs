//! Session lifecycle, per-session runtime and state

pub mod error;
pub mod lifecycle;
pub mod runtime;
pub mod service;
pub mod state;

pub use error::SessionError;
pub use service::{CreateSessionParams, SessionService};
pub use state::{Participant, SessionState};
