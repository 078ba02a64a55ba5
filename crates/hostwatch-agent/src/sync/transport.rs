// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use tokio::time::timeout;
use url::Url;

use super::connection::{connect_plain, Connection, Connector};
use super::TransportError;
use crate::settings::ApiTarget;

/// Largest response body read from the backend or a local service.
pub const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Backend endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Collect,
    Packages,
}

impl Endpoint {
    pub const fn path(self) -> &'static str {
        match self {
            Endpoint::Collect => "/collect",
            Endpoint::Packages => "/packages",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// A fully encoded POST.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub endpoint: Endpoint,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Delivers one request attempt. Retries are the caller's business.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

async fn exchange(
    mut connection: Connection,
    request: Request<Full<Bytes>>,
    limit: Duration,
    max_body: usize,
) -> Result<ApiResponse, TransportError> {
    let response = timeout(limit, connection.sender.send_request(request))
        .await
        .map_err(|_| TransportError::Timeout("response"))??;
    let status = response.status();
    let body = timeout(limit, Limited::new(response.into_body(), max_body).collect())
        .await
        .map_err(|_| TransportError::Timeout("response body"))?
        .map_err(|e| match e.downcast::<hyper::Error>() {
            Ok(e) => TransportError::Http(*e),
            Err(_) => TransportError::ResponseTooLarge(max_body),
        })?
        .to_bytes();
    Ok(ApiResponse { status, body })
}

/// Production transport: a fresh TLS connection for every attempt.
pub struct HttpsTransport {
    connector: Connector,
}

impl HttpsTransport {
    pub fn new(target: ApiTarget, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            connector: Connector::new(target, tls_config),
        }
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    async fn post(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let connection = self.connector.connect(request.timeout).await?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(request.endpoint.path())
            .header(HOST, self.connector.target().authority());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let http_request = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        exchange(connection, http_request, request.timeout, MAX_RESPONSE_BYTES).await
    }
}

/// Plain `GET` against a loopback `http://` URL, used by service collectors.
pub async fn loopback_get(url: &Url, limit: Duration) -> Result<ApiResponse, TransportError> {
    if url.scheme() != "http" {
        return Err(TransportError::InvalidRequest(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| TransportError::InvalidRequest(format!("no host in {url}")))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let connection = connect_plain(host, port, limit).await?;

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let authority = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or(host)),
        None => url.host_str().unwrap_or(host).to_string(),
    };
    let request = Request::builder()
        .method(Method::GET)
        .uri(target)
        .header(HOST, authority)
        .body(Full::new(Bytes::new()))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    exchange(connection, request, limit, MAX_RESPONSE_BYTES).await
}
