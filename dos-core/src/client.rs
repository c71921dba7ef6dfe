use crate::api::{
    CreateObjectRequest, ErrorResponse, HealthResponse, LeaseResponse, StatusResponse,
    UpdateObjectRequest,
};
use crate::error::{DosError, Result};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

/// HTTP client for the name node's object API.
#[derive(Clone)]
pub struct DosClient {
    client: Client,
    base_url: String,
}

impl DosClient {
    /// `name_node` is `host:port` or a full `http://` URL.
    pub fn new(name_node: &str) -> Self {
        let base_url = if name_node.starts_with("http://") || name_node.starts_with("https://") {
            name_node.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", name_node.trim_end_matches('/'))
        };
        Self {
            client: Client::new(),
            base_url,
        }
    }

    /// Join percent-encoded path segments onto the base URL.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|error| DosError::Http(format!("bad url {}: {}", self.base_url, error)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| DosError::Http(format!("bad url {}", self.base_url)))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn object_url(&self, name: &str) -> Result<Url> {
        self.url(&["api", "v1", "objects", name])
    }

    pub async fn create_object(&self, name: &str, data: &[u8]) -> Result<StatusResponse> {
        let request = CreateObjectRequest {
            name: name.to_string(),
            data: data.to_vec(),
        };
        let response = self
            .client
            .post(self.url(&["api", "v1", "objects"])?)
            .json(&request)
            .send()
            .await
            .map_err(|error| DosError::Http(error.to_string()))?;
        decode(response, name).await
    }

    pub async fn delete_object(&self, name: &str) -> Result<StatusResponse> {
        let response = self
            .client
            .delete(self.object_url(name)?)
            .send()
            .await
            .map_err(|error| DosError::Http(error.to_string()))?;
        decode(response, name).await
    }

    pub async fn update_object(&self, name: &str, data: &[u8]) -> Result<StatusResponse> {
        let request = UpdateObjectRequest {
            data: data.to_vec(),
        };
        let response = self
            .client
            .put(self.object_url(name)?)
            .json(&request)
            .send()
            .await
            .map_err(|error| DosError::Http(error.to_string()))?;
        decode(response, name).await
    }

    pub async fn lease_object(&self, name: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url(&["api", "v1", "objects", name, "lease"])?)
            .send()
            .await
            .map_err(|error| DosError::Http(error.to_string()))?;
        let lease: LeaseResponse = decode(response, name).await?;
        Ok(lease.lease_endpoints)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .client
            .get(self.url(&["health"])?)
            .send()
            .await
            .map_err(|error| DosError::Http(error.to_string()))?;
        decode(response, "").await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, name: &str) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|error| DosError::Http(error.to_string()));
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::CONFLICT => DosError::ObjectAlreadyExists(name.to_string()),
        StatusCode::NOT_FOUND => DosError::ObjectNotFound(name.to_string()),
        _ => DosError::Http(format!("status={} error={}", status, message)),
    })
}
