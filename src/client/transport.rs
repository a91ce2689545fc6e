//! Transport adapter: request/response calls and the duplex channel.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::models::api::ErrorBody;
use crate::models::endpoint::Endpoint;
use crate::{AppError, Result};

/// Open duplex channel.
pub type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Request/response half of the transport, bound to one endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionFailed` for malformed endpoints and
    /// `AppError::Network` if the HTTP client cannot be built.
    pub fn new(endpoint: &Endpoint, request_timeout: Duration) -> Result<Self> {
        let base = endpoint.base_url()?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("companion-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            token: endpoint.auth_token().map(str::to_owned),
            request_timeout,
        })
    }

    /// `GET path`, decoding a JSON body.
    ///
    /// # Errors
    ///
    /// See [`Self::decode`].
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .send(self.request(Method::GET, path)?, Some(self.request_timeout))
            .await?;
        Self::decode(response).await
    }

    /// `POST path` with a JSON body.
    ///
    /// `timeout` of `None` waits indefinitely, for prompts that run as long
    /// as the backend needs.
    ///
    /// # Errors
    ///
    /// See [`Self::decode`].
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let builder = self.request(Method::POST, path)?.json(body);
        let response = self.send(builder, timeout).await?;
        Self::decode(response).await
    }

    /// `DELETE path`, decoding a JSON body.
    ///
    /// # Errors
    ///
    /// See [`Self::decode`].
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .send(self.request(Method::DELETE, path)?, Some(self.request_timeout))
            .await?;
        Self::decode(response).await
    }

    /// Send a request and return the raw response regardless of status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Network` / `AppError::Timeout` on transport
    /// failure.
    pub async fn send(&self, builder: RequestBuilder, timeout: Option<Duration>) -> Result<Response> {
        let builder = match timeout {
            Some(limit) => builder.timeout(limit),
            None => builder,
        };
        let builder = match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        };
        Ok(builder.send().await?)
    }

    /// Start a request for `path` relative to the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionFailed` if `path` cannot be joined.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|err| AppError::ConnectionFailed(format!("invalid path {path}: {err}")))?;
        Ok(self.client.request(method, url))
    }

    /// Decode a success body or turn a failure into its [`AppError`].
    ///
    /// # Errors
    ///
    /// - `AppError::AuthenticationFailed` on 401/403.
    /// - The error carried by a structured error body.
    /// - `AppError::InvalidResponse` for bodies that do not parse.
    pub async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            return serde_json::from_slice(&bytes).map_err(AppError::from);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AppError::AuthenticationFailed);
        }
        let bytes = response.bytes().await?;
        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(body.into_error()),
            Err(_) => {
                debug!(%status, "error response without structured body");
                Err(AppError::InvalidResponse(format!("unexpected HTTP {status}")))
            }
        }
    }
}

/// Open the duplex channel, carrying the bearer credential on the upgrade.
///
/// # Errors
///
/// - `AppError::AuthenticationFailed` if the upgrade is rejected with
///   401/403.
/// - `AppError::ConnectionFailed` for other rejections or bad endpoints.
/// - `AppError::Timeout` if the handshake does not finish in `timeout`.
pub async fn open_channel(endpoint: &Endpoint, timeout: Duration) -> Result<Channel> {
    let url = endpoint.channel_url()?;
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = endpoint.auth_token() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| AppError::ConnectionFailed("auth token is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (channel, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| AppError::Timeout(format!("channel handshake exceeded {}s", timeout.as_secs())))??;
    debug!(status = %response.status(), "channel open");
    Ok(channel)
}
