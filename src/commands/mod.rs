//! Chat boundary handlers
//!
//! Transport-free request/response types and handlers that the HTTP layer
//! maps onto `POST /api/chat` and the chat initialization route.

pub mod chat;
pub mod sessions;
