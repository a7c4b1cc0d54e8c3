// ABOUTME: Core data models for terminal bridge sessions and their targets

pub mod session;

pub use session::{Session, SessionId, SessionStatus, Target};
