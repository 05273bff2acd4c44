//! Mutual TLS for node-to-node hop calls
//!
//! Both sides present a certificate chained to the configured trust root.
//! The server only speaks TLS 1.3 and rejects clients without a verifiable
//! certificate during the handshake.

use crate::{Error, Result};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::transport::{ClientTlsConfig, Identity};

/// Certificate material for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Node certificate (PEM), used as both server and client identity
    pub cert_path: PathBuf,
    /// Node private key (PKCS#8 PEM)
    pub key_path: PathBuf,
    /// Trust root that peer certificates must chain to (PEM)
    pub ca_cert_path: PathBuf,
    /// Name to verify in peer server certificates; defaults to the peer host
    pub domain_name: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("./certs/node.crt"),
            key_path: PathBuf::from("./certs/node.key"),
            ca_cert_path: PathBuf::from("./certs/ca.crt"),
            domain_name: None,
        }
    }
}

impl TlsSettings {
    /// Settings rooted in one directory holding `ca.crt`, `<name>.crt` and `<name>.key`
    pub fn in_dir(dir: impl AsRef<Path>, name: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_path: dir.join(format!("{}.crt", name)),
            key_path: dir.join(format!("{}.key", name)),
            ca_cert_path: dir.join("ca.crt"),
            domain_name: None,
        }
    }

    /// Server configuration: TLS 1.3 only, client certificate required, ALPN h2
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;
        let roots = load_roots(&self.ca_cert_path)?;

        let mut config = ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
            .with_single_cert(cert_chain, private_key)?;

        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Arc::new(config))
    }

    /// Client configuration for tonic channels
    pub fn client_config(&self, default_domain: &str) -> Result<ClientTlsConfig> {
        let ca_pem = std::fs::read(&self.ca_cert_path)?;
        let cert_pem = std::fs::read(&self.cert_path)?;
        let key_pem = std::fs::read(&self.key_path)?;

        let domain = self
            .domain_name
            .clone()
            .unwrap_or_else(|| default_domain.to_string());

        Ok(ClientTlsConfig::new()
            .ca_certificate(tonic::transport::Certificate::from_pem(ca_pem))
            .identity(Identity::from_pem(cert_pem, key_pem))
            .domain_name(domain))
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let chain: Vec<Certificate> = certs(&mut reader)
        .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?
        .into_iter()
        .map(Certificate)
        .collect();

    if chain.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?;

    if keys.is_empty() {
        return Err(Error::Tls(format!(
            "no PKCS#8 private key found in {}",
            path.display()
        )));
    }
    Ok(PrivateKey(keys.remove(0)))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| Error::Tls(format!("failed to add trust root: {}", e)))?;
    }
    Ok(roots)
}

/// Certificate generator for development and tests
pub struct CertificateGenerator;

impl CertificateGenerator {
    /// Generate a CA plus one certificate per node, all signed by that CA
    ///
    /// Writes `ca.crt`, `ca.key` and `<node>.crt` / `<node>.key` into
    /// `output_dir`. Each node certificate carries `dns_names` as SANs and is
    /// valid for both server and client authentication.
    pub fn generate_mesh(
        output_dir: impl AsRef<Path>,
        ca_common_name: &str,
        nodes: &[(&str, Vec<String>)],
    ) -> Result<()> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)?;

        let mut ca_params = rcgen::CertificateParams::new(Vec::new());
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, ca_common_name);
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let ca_cert = rcgen::Certificate::from_params(ca_params)?;

        std::fs::write(output_dir.join("ca.crt"), ca_cert.serialize_pem()?)?;
        std::fs::write(
            output_dir.join("ca.key"),
            ca_cert.serialize_private_key_pem(),
        )?;

        for (name, dns_names) in nodes {
            let mut params = rcgen::CertificateParams::new(dns_names.clone());
            params
                .distinguished_name
                .push(rcgen::DnType::CommonName, *name);
            params.key_usages = vec![
                rcgen::KeyUsagePurpose::DigitalSignature,
                rcgen::KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![
                rcgen::ExtendedKeyUsagePurpose::ServerAuth,
                rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            ];
            let cert = rcgen::Certificate::from_params(params)?;

            std::fs::write(
                output_dir.join(format!("{}.crt", name)),
                cert.serialize_pem_with_signer(&ca_cert)?,
            )?;
            std::fs::write(
                output_dir.join(format!("{}.key", name)),
                cert.serialize_private_key_pem(),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_mesh() {
        let dir = tempdir().unwrap();
        CertificateGenerator::generate_mesh(
            dir.path(),
            "Mesh CA",
            &[
                ("node-a", vec!["localhost".to_string()]),
                ("node-b", vec!["localhost".to_string()]),
            ],
        )
        .unwrap();

        for file in ["ca.crt", "ca.key", "node-a.crt", "node-a.key", "node-b.crt"] {
            assert!(dir.path().join(file).exists(), "{} missing", file);
        }
    }

    #[test]
    fn test_load_server_and_client_config() {
        let dir = tempdir().unwrap();
        CertificateGenerator::generate_mesh(
            dir.path(),
            "Mesh CA",
            &[("node-a", vec!["localhost".to_string()])],
        )
        .unwrap();

        let settings = TlsSettings::in_dir(dir.path(), "node-a");
        let server = settings.server_config().unwrap();
        assert_eq!(server.alpn_protocols, vec![b"h2".to_vec()]);
        assert!(settings.client_config("localhost").is_ok());
    }

    #[test]
    fn test_missing_material_is_an_error() {
        let dir = tempdir().unwrap();
        let settings = TlsSettings::in_dir(dir.path(), "absent");
        assert!(settings.server_config().is_err());
        assert!(settings.client_config("localhost").is_err());
    }
}
