//! Raw request execution against the backend.
//!
//! The `Transport` trait is the seam between session logic and the network:
//! the gateway and the refresh coordinator only ever see `ApiRequest` in and
//! `ApiResponse` out.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::envelope::decode_data;
use super::ApiError;

/// A request to the ForgeBase API, relative to the configured base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }
}

/// Status and body of a completed HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Decode the `data` of a success envelope, or turn a failure status
    /// into the matching `ApiError`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        if !self.is_success() {
            return Err(ApiError::from_status(self.status, &self.body));
        }
        decode_data(&self.body)
    }
}

/// Executes a single request. Implementations never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`, with `bearer` as the `Authorization: Bearer` credential
    /// when given. Any status code is a successful exchange; only failures to
    /// get a response at all are errors.
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError>;
}

/// `Transport` backed by reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::from_transport)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        debug!(method = %request.method, url = %url, authenticated = bearer.is_some(), "Sending request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::from_transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(ApiError::from_transport)?;

        debug!(method = %request.method, url = %url, status, "Received response");
        Ok(ApiResponse { status, body })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let transport = ReqwestTransport::new("http://localhost:8080/", Duration::from_secs(5))
            .expect("client builds");
        assert_eq!(transport.base_url(), "http://localhost:8080");
        assert_eq!(
            transport.url("/api/v1/health"),
            "http://localhost:8080/api/v1/health"
        );
        assert_eq!(transport.url("api/v1/health"), "http://localhost:8080/api/v1/health");
    }

    #[test]
    fn test_into_data() {
        let ok = ApiResponse::new(200, r#"{"data":{"name":"site"}}"#);
        let value: serde_json::Value = ok.into_data().expect("success envelope");
        assert_eq!(value["name"], "site");

        let rejected = ApiResponse::new(400, r#"{"error":{"message":"Name is required"}}"#);
        let err = rejected.into_data::<serde_json::Value>().unwrap_err();
        assert_eq!(err.to_string(), "Name is required");
    }

    #[test]
    fn test_request_json_body() {
        let request = ApiRequest::post("/api/v1/auth/signin")
            .json(&serde_json::json!({"email": "demo@example.com"}))
            .expect("encodes");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.unwrap()["email"], "demo@example.com");
    }
}
