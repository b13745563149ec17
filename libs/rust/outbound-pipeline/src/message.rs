//! Request and response types carried through the pipeline.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::PipelineError;

/// An outgoing HTTP request.
///
/// Stages pass it through unmodified. Cloning is cheap: the body is a
/// reference-counted [`Bytes`] buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    operation_key: Option<String>,
}

impl OutboundRequest {
    /// Create a request with an empty body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            operation_key: None,
        }
    }

    /// Create a GET request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON body and content type.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self, PipelineError> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    /// Name the logical operation this request belongs to.
    #[must_use]
    pub fn with_operation_key(mut self, key: impl Into<String>) -> Self {
        self.operation_key = Some(key.into());
        self
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Request headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Logical operation name, if one was set.
    #[must_use]
    pub fn operation_key(&self) -> Option<&str> {
        self.operation_key.as_deref()
    }

    /// `host` or `host:port` of the target; the port is left out when it is
    /// the scheme's default.
    #[must_use]
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

/// A response received from, or synthesized on behalf of, the transport.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request: OutboundRequest,
}

impl OutboundResponse {
    /// Create a response for the given request.
    #[must_use]
    pub const fn new(status: StatusCode, headers: HeaderMap, body: Bytes, request: OutboundRequest) -> Self {
        Self {
            status,
            headers,
            body,
            request,
        }
    }

    /// Create an empty response that no server sent.
    #[must_use]
    pub fn synthesized(status: StatusCode, request: OutboundRequest) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new(), request)
    }

    /// Status code.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the status is in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Response headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Response body.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// The request this response answers.
    #[must_use]
    pub const fn request(&self) -> &OutboundRequest {
        &self.request
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Fail with [`PipelineError::UnexpectedStatus`] unless the status is 2xx.
    ///
    /// # Errors
    ///
    /// Returns an error for any non-success status.
    pub fn error_for_status(self) -> Result<Self, PipelineError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PipelineError::UnexpectedStatus {
                status: self.status,
                url: self.request.url().clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_omits_default_port() {
        let req = OutboundRequest::get(Url::parse("http://catalog.api/api/v1/Catalog").unwrap());
        assert_eq!(req.authority(), "catalog.api");

        let req = OutboundRequest::get(Url::parse("https://basket.api:443/").unwrap());
        assert_eq!(req.authority(), "basket.api");
    }

    #[test]
    fn test_authority_keeps_explicit_port() {
        let req = OutboundRequest::get(Url::parse("http://localhost:8001/api/v1/Basket/swn").unwrap());
        assert_eq!(req.authority(), "localhost:8001");
    }

    #[test]
    fn test_synthesized_response_keeps_request() {
        let req = OutboundRequest::get(Url::parse("http://localhost:8004/api/v1/Order").unwrap())
            .with_operation_key("GetOrdersByUserName");
        let resp = OutboundResponse::synthesized(StatusCode::BAD_GATEWAY, req.clone());

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.request(), &req);
        assert!(resp.body().is_empty());
        assert!(!resp.is_success());
    }

    #[test]
    fn test_json_body_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Item {
            product_id: String,
            quantity: u32,
        }

        let item = Item { product_id: "602d2149e773f2a3990b47f5".to_string(), quantity: 2 };
        let req = OutboundRequest::new(Method::POST, Url::parse("http://localhost:8001/api/v1/Basket").unwrap())
            .with_json(&item)
            .unwrap();
        assert_eq!(req.headers()[reqwest::header::CONTENT_TYPE], "application/json");

        let resp = OutboundResponse::new(StatusCode::OK, HeaderMap::new(), req.body().clone(), req);
        assert_eq!(resp.json::<Item>().unwrap(), item);
    }

    #[test]
    fn test_error_for_status() {
        let req = OutboundRequest::get(Url::parse("http://localhost:8000/missing").unwrap());
        let resp = OutboundResponse::synthesized(StatusCode::NOT_FOUND, req);
        assert!(matches!(
            resp.error_for_status(),
            Err(PipelineError::UnexpectedStatus { status: StatusCode::NOT_FOUND, .. })
        ));
    }
}
