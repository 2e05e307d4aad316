//! TLS client configuration and certificate loading
//!
//! Builds the rustls `ClientConfig` used by [`crate::client::TcpConnector`]
//! when endpoints are marked `ssl` or `tls yes` is configured.

use rustls::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Load TLS client configuration
///
/// `ca_path` populates the root store. A client certificate is only presented
/// when both `cert_path` and `key_path` are given.
pub fn load_client_tls_config(
    ca_path: Option<&Path>,
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();

    if let Some(ca_path) = ca_path {
        let certs = load_certs(ca_path)?;
        if certs.is_empty() {
            return Err(Error::Tls(format!(
                "no certificates found in {}",
                ca_path.display()
            )));
        }
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| Error::Tls(e.to_string()))?;
        }
    } else {
        log::warn!("TLS enabled without tls-ca-cert-file, server certificates will not verify");
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Tls(e.to_string()))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::Config(
                "tls-cert-file and tls-key-file must be set together".into(),
            ));
        }
    };

    Ok(Arc::new(config))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|r| r.ok())
        .collect();

    Ok(certs)
}

/// Load the first private key found in a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => break,
        }
    }

    Err(Error::Tls(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_ca_file() {
        let err = load_client_tls_config(Some(Path::new("/nonexistent/ca.pem")), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_empty_ca_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = load_client_tls_config(Some(file.path()), None, None).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let err = load_client_tls_config(None, Some(Path::new("cert.pem")), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
