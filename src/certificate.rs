//! Certificate manager for TLS termination on proxy listeners and the
//! management port. Generates a self-signed pair when none is on disk.

use anyhow::{anyhow, Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

const CERT_FILE: &str = "proxy_certificate.pem";
const KEY_FILE: &str = "proxy_private_key.pem";

/// Certificate manager for handling SSL certificates
pub struct CertificateManager {
    certs_dir: PathBuf,
}

impl CertificateManager {
    /// Create a new certificate manager, generating a default certificate if
    /// the directory has none.
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)
            .with_context(|| format!("Failed to create certs dir {}", certs_dir.display()))?;

        let manager = Self { certs_dir };
        manager.ensure_default_cert()?;
        Ok(manager)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.certs_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.certs_dir.join(KEY_FILE)
    }

    fn ensure_default_cert(&self) -> Result<()> {
        if !self.cert_path().exists() || !self.key_path().exists() {
            info!("Generating default self-signed certificate");
            self.generate_self_signed(&["localhost", "127.0.0.1"])?;
        }
        Ok(())
    }

    /// Generate a self-signed certificate and overwrite the stored pair.
    pub fn generate_self_signed(&self, san: &[&str]) -> Result<()> {
        let subject_alt_names: Vec<String> = san.iter().map(|s| s.to_string()).collect();

        let cert = generate_simple_self_signed(subject_alt_names)?;
        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();

        fs::write(self.cert_path(), &cert_pem)?;
        fs::write(self.key_path(), &key_pem)?;

        info!("Generated self-signed certificate in {}", self.certs_dir.display());
        Ok(())
    }

    /// rustls server configuration built from the stored pair.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let mut cert_reader = BufReader::new(
            File::open(self.cert_path()).context("Failed to open certificate")?,
        );
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<_, _>>()
            .context("Failed to parse certificate")?;

        let mut key_reader =
            BufReader::new(File::open(self.key_path()).context("Failed to open private key")?);
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow!("No private key in {}", self.key_path().display()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Invalid certificate/key pair")?;

        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}
