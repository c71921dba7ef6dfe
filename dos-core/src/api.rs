//! JSON bodies of the client-facing HTTP API.

use crate::protocol::base64_bytes;
use serde::{Deserialize, Serialize};

pub const CREATED: &str = "CREATED";
pub const DELETED: &str = "DELETED";
pub const UPDATED: &str = "UPDATED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateObjectRequest {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateObjectRequest {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub lease_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub nodes: usize,
    pub ghosts: usize,
    pub objects: usize,
    pub sequence: u64,
}
