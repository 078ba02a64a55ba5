// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Trust store and TLS client configuration for the backend connection.
//!
//! The agent never disables certificate verification, so every configuration
//! produced here verifies the server chain against a root store and the
//! server name sent via SNI.

use rustls::ClientConfig;
use std::error::Error;
use std::sync::Arc;
#[cfg(feature = "fips")]
use tracing::debug;

/// Installs the process-wide FIPS crypto provider. Must run before any
/// TLS configuration is built.
#[cfg(feature = "fips")]
pub fn prepare_client_provider() -> Result<(), Box<dyn Error + Send + Sync>> {
    rustls::crypto::default_fips_provider()
        .install_default()
        .map_err(|e| format!("Failed to set up fips provider: {e:?}").into())
}

/// No-op outside FIPS builds; the provider selected by crate features is used.
#[cfg(not(feature = "fips"))]
#[allow(clippy::unnecessary_wraps)]
pub fn prepare_client_provider() -> Result<(), Box<dyn Error + Send + Sync>> {
    Ok(())
}

/// Creates the rustls client configuration used for every backend handshake.
/// Roots come from the bundled Mozilla trust store.
#[cfg(not(feature = "fips"))]
pub fn create_tls_client_config() -> Result<Arc<ClientConfig>, Box<dyn Error + Send + Sync>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if root_store.is_empty() {
        return Err("Bundled root store is empty".into());
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Creates a FIPS-compliant rustls client configuration.
/// This version loads native root certificates and verifies FIPS compliance.
#[cfg(feature = "fips")]
pub fn create_tls_client_config() -> Result<Arc<ClientConfig>, Box<dyn Error + Send + Sync>> {
    // The process-wide provider must have been installed at startup with
    // rustls::crypto::default_fips_provider().install_default()
    let provider =
        rustls::crypto::CryptoProvider::get_default().ok_or("No crypto provider configured")?;

    if !provider.fips() {
        return Err("Crypto provider is not FIPS-compliant".into());
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => {
                debug!("Failed to parse certificate: {:?}", err);
            }
        }
    }
    if valid_count == 0 {
        return Err("No valid certificates found in native root store".into());
    }

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|_| "Failed to set protocol versions")?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    if !config.fips() {
        return Err("The final TLS configuration is not FIPS-compliant".into());
    }
    debug!("TLS client is configured with FIPS.");

    Ok(Arc::new(config))
}
