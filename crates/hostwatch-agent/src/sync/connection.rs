// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One HTTP/1.1 connection per request attempt.
//!
//! Addresses are resolved with A records first; AAAA records are only looked
//! up once every IPv4 address has refused the connection. The first address
//! accepting TCP within the timeout carries the TLS handshake, with the
//! configured host name as SNI and certificate subject.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_resolver::TokioResolver;
use http_body_util::Full;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::TransportError;
use crate::settings::ApiTarget;

pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

/// An established HTTP/1 connection. The connection task is aborted on drop.
pub struct Connection {
    pub(crate) sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Runs the HTTP/1 handshake over an already connected stream.
pub(crate) async fn handshake<S>(stream: S) -> Result<Connection, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection closed with error: {e}");
        }
    });
    Ok(Connection { sender, driver })
}

/// Opens plaintext TCP to `host:port`.
pub(crate) async fn connect_plain(
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<Connection, TransportError> {
    let stream = timeout(limit, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout("connect"))?
        .map_err(|e| TransportError::Connect(format!("{host}:{port}: {e}")))?;
    handshake(stream).await
}

/// Connection factory for the backend.
pub struct Connector {
    target: ApiTarget,
    tls: TlsConnector,
    resolver: Option<TokioResolver>,
}

impl Connector {
    pub fn new(target: ApiTarget, tls_config: Arc<ClientConfig>) -> Self {
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => Some(builder.build()),
            Err(e) => {
                warn!("Failed to read the system resolver configuration: {e}");
                None
            }
        };
        Self {
            target,
            tls: TlsConnector::from(tls_config),
            resolver,
        }
    }

    pub fn target(&self) -> &ApiTarget {
        &self.target
    }

    /// Opens a connection to the backend, trying every resolved address.
    pub async fn connect(&self, limit: Duration) -> Result<Connection, TransportError> {
        if self.target.is_plaintext() {
            return connect_plain(self.target.host(), self.target.port(), limit).await;
        }

        for family in [Family::V4, Family::V6] {
            for ip in self.resolve(family).await {
                let address = SocketAddr::new(ip, self.target.port());
                match timeout(limit, TcpStream::connect(address)).await {
                    Ok(Ok(stream)) => return self.secure(stream, limit).await,
                    Ok(Err(e)) => warn!(%address, "Could not connect: {e}"),
                    Err(_) => warn!(%address, "Connect timed out after {limit:?}"),
                }
            }
        }
        Err(TransportError::Unreachable(self.target.host().to_string()))
    }

    async fn secure(
        &self,
        stream: TcpStream,
        limit: Duration,
    ) -> Result<Connection, TransportError> {
        let server_name = ServerName::try_from(self.target.host().to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;
        let tls_stream = timeout(limit, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| TransportError::Timeout("tls handshake"))?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        handshake(tls_stream).await
    }

    async fn resolve(&self, family: Family) -> Vec<IpAddr> {
        let host = self.target.host();
        if let Some(ip) = self.target.ip() {
            let matches = matches!(
                (family, ip),
                (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
            );
            return if matches { vec![ip] } else { Vec::new() };
        }
        let Some(resolver) = &self.resolver else {
            return Vec::new();
        };

        let addresses: Result<Vec<IpAddr>, String> = match family {
            Family::V4 => match timeout(DNS_TIMEOUT, resolver.ipv4_lookup(host)).await {
                Ok(Ok(lookup)) => Ok(lookup.iter().map(|a| IpAddr::V4(a.0)).collect()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("lookup timed out".to_string()),
            },
            Family::V6 => match timeout(DNS_TIMEOUT, resolver.ipv6_lookup(host)).await {
                Ok(Ok(lookup)) => Ok(lookup.iter().map(|a| IpAddr::V6(a.0)).collect()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("lookup timed out".to_string()),
            },
        };
        match addresses {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!(host, family = ?family, "DNS resolution failed: {e}");
                Vec::new()
            }
        }
    }
}
