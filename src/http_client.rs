//! A minimal interface for the pipeline's outbound HTTP.
//!
//! Both the ingestion transmitter and the live metrics loop talk through
//! [`HttpClient`], so users can bring their own client and tests can
//! script responses without a network.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

/// Boxed transport error; the callers only classify, never downcast.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Sends one request and returns the full response, status and headers
/// included. Implementations must not retry; retry policy belongs to the
/// callers.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError>;
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
        let request = request.try_into()?;
        let response = self.execute(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let mut converted = Response::builder().status(status.as_u16()).body(body)?;
        *converted.headers_mut() = headers;
        Ok(converted)
    }
}
