//! Request handlers for the API surface.

pub mod channels;
pub mod chat;
pub mod presence;
