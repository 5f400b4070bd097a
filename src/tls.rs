//! TLS credential loading
//!
//! Parses the PEM certificate/key/CA material named by `tls.cert`,
//! `tls.key`, and `tls.ca` and builds a [`rustls::ServerConfig`] that
//! requires the peer to present a certificate signed by the configured
//! CA. Relays that fail the handshake never reach the relay pool.

use crate::config::TlsConfig;
use crate::Result;
use anyhow::{bail, Context};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::server::AllowAnyAuthenticatedClient;
use tokio_rustls::rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// Read every PEM block labeled `CERTIFICATE` out of `path`.
fn read_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open certificate file: {}", path.display()))?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let certificates: Vec<Certificate> = pem::parse_many(&contents)
        .with_context(|| format!("Invalid PEM encoding in {}", path.display()))?
        .into_iter()
        .filter(|p| p.tag == "CERTIFICATE")
        .map(|p| Certificate(p.contents))
        .collect();

    if certificates.is_empty() {
        bail!("No CERTIFICATE blocks found in {}", path.display());
    }
    Ok(certificates)
}

/// Read a single PEM-encoded private key out of `path`, accepting the
/// `PRIVATE KEY`, `RSA PRIVATE KEY`, and `EC PRIVATE KEY` labels.
fn read_private_key(path: &Path) -> Result<PrivateKey> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open key file: {}", path.display()))?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let pem = pem::parse(&contents).with_context(|| format!("Invalid PEM encoding in {}", path.display()))?;
    match pem.tag.as_str() {
        "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY" => Ok(PrivateKey(pem.contents)),
        other => bail!("{}: expected a private key, found '{}'", path.display(), other),
    }
}

/// Build a [`RootCertStore`] from every certificate in the CA bundle at `path`.
fn read_root_store(path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in read_certificates(path)? {
        store
            .add(&cert)
            .with_context(|| format!("Failed to add CA certificate from {}", path.display()))?;
    }
    Ok(store)
}

/// Build the mutual-TLS [`TlsAcceptor`] the relay listener accepts
/// connections through. All three of `cert`, `key`, and `ca` must be set;
/// `ConfigManager::validate` enforces this too, but tests and tools can
/// call this directly without going through `Config::validate` first.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_path = tls
        .cert
        .as_ref()
        .context("tls.cert is required to build the relay TLS acceptor")?;
    let key_path = tls
        .key
        .as_ref()
        .context("tls.key is required to build the relay TLS acceptor")?;
    let ca_path = tls
        .ca
        .as_ref()
        .context("tls.ca is required to build the relay TLS acceptor")?;

    let certs = read_certificates(cert_path)?;
    let key = read_private_key(key_path)?;
    let root_store = read_root_store(ca_path)?;

    let client_verifier = AllowAnyAuthenticatedClient::new(root_store);

    let server_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(client_verifier))
        .with_single_cert(certs, key)
        .context("Failed to build TLS server configuration")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_are_rejected() {
        let tls = TlsConfig {
            cert: None,
            key: None,
            ca: None,
        };
        assert!(build_acceptor(&tls).is_err());
    }

    #[test]
    fn nonexistent_cert_file_is_rejected() {
        let tls = TlsConfig {
            cert: Some("/nonexistent/cert.pem".into()),
            key: Some("/nonexistent/key.pem".into()),
            ca: Some("/nonexistent/ca.pem".into()),
        };
        assert!(build_acceptor(&tls).is_err());
    }
}
