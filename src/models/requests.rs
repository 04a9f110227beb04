//! Request DTOs for the inspection API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

/// Request body for POST /network
///
/// Lets an embedding host report connectivity it detected itself.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkRequest {
    pub online: bool,
}
