//! PEM certificate/key loading for TLS listeners (rustls, ring provider).
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::errors::BridgeError;

pub(crate) fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, BridgeError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BridgeError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BridgeError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, BridgeError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| BridgeError::Tls(format!("{}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BridgeError> {
    let mut rd = open(path)?;
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BridgeError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(BridgeError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, BridgeError> {
    let mut rd = open(path)?;
    rustls_pemfile::private_key(&mut rd)
        .map_err(|e| BridgeError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| BridgeError::Tls(format!("{}: no private key found", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_tls_errors() {
        let td = tempfile::tempdir().expect("tmpdir");
        let err = load_server_config(&td.path().join("c.pem"), &td.path().join("k.pem"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Tls(_)));
        assert!(err.to_string().starts_with("Failed to load TLS cert: "));
    }

    #[test]
    fn test_pem_without_certificates_is_rejected() {
        let td = tempfile::tempdir().expect("tmpdir");
        let cert = td.path().join("c.pem");
        let key = td.path().join("k.pem");
        std::fs::write(&cert, "not a pem\n").unwrap();
        std::fs::write(&key, "not a pem\n").unwrap();
        let err = load_server_config(&cert, &key).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }
}
