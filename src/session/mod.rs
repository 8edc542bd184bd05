pub mod registry;
pub mod token;

pub use {
    registry::{ConnectionRegistry, Frame, SessionId, SESSION_QUEUE_CAPACITY},
    token::{Departure, SessionToken},
};
