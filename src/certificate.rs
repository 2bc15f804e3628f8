//! Per-domain certificate resolution for the TLS listener
//!
//! Certificates are a filesystem convention: `<certs_dir>/<domain>.crt` holds
//! the PEM chain and `<certs_dir>/<domain>.key` the private key. The pair is
//! looked up during the handshake from the client's SNI, so adding a domain
//! or rotating a certificate needs no restart.

use crate::error::{Error, Result};
use dashmap::DashMap;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Modification time and size of both files of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    cert: (SystemTime, u64),
    key: (SystemTime, u64),
}

impl FileStamp {
    fn read(cert_path: &Path, key_path: &Path) -> std::io::Result<Self> {
        let stamp = |path: &Path| -> std::io::Result<(SystemTime, u64)> {
            let metadata = fs::metadata(path)?;
            Ok((metadata.modified()?, metadata.len()))
        };
        Ok(Self {
            cert: stamp(cert_path)?,
            key: stamp(key_path)?,
        })
    }
}

struct CachedPair {
    stamp: FileStamp,
    key: Arc<CertifiedKey>,
}

/// SNI certificate resolver over a certificate directory
///
/// Parsed pairs are cached per domain and reused only while both files are
/// unchanged on disk; every handshake still stats the files.
pub struct CertResolver {
    certs_dir: PathBuf,
    cache: DashMap<String, CachedPair>,
}

impl CertResolver {
    /// Create a resolver, creating the certificate directory if needed
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&certs_dir)?;

        Ok(Self {
            certs_dir,
            cache: DashMap::new(),
        })
    }

    /// Get certs directory path
    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Conventional certificate and key paths for a domain
    pub fn paths(&self, domain: &str) -> Result<(PathBuf, PathBuf)> {
        if domain.is_empty()
            || domain.starts_with('.')
            || domain.contains(['/', '\\', '\0'])
        {
            return Err(Error::Handshake(format!("unusable server name {:?}", domain)));
        }

        Ok((
            self.certs_dir.join(format!("{}.crt", domain)),
            self.certs_dir.join(format!("{}.key", domain)),
        ))
    }

    /// Load the certificate pair for a domain
    pub fn load(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        let (cert_path, key_path) = self.paths(domain)?;

        let stamp = match FileStamp::read(&cert_path, &key_path) {
            Ok(stamp) => stamp,
            Err(e) => {
                self.cache.remove(domain);
                return Err(Error::Handshake(format!(
                    "cannot load cert for {}: {}",
                    domain, e
                )));
            }
        };

        if let Some(cached) = self.cache.get(domain) {
            if cached.stamp == stamp {
                return Ok(cached.key.clone());
            }
        }

        let key = match Self::read_pair(&cert_path, &key_path) {
            Ok(key) => Arc::new(key),
            Err(e) => {
                self.cache.remove(domain);
                return Err(e);
            }
        };

        debug!("Loaded certificate for {}", domain);
        self.cache.insert(
            domain.to_string(),
            CachedPair {
                stamp,
                key: key.clone(),
            },
        );

        Ok(key)
    }

    fn read_pair(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
        let cert_file = File::open(cert_path).map_err(|e| {
            Error::Handshake(format!("failed to open {}: {}", cert_path.display(), e))
        })?;
        let chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::io::Result<Vec<CertificateDer<'static>>>>()
            .map_err(|e| {
                Error::Handshake(format!("failed to read {}: {}", cert_path.display(), e))
            })?;

        if chain.is_empty() {
            return Err(Error::Handshake(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let key_file = File::open(key_path).map_err(|e| {
            Error::Handshake(format!("failed to open {}: {}", key_path.display(), e))
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| {
                Error::Handshake(format!("failed to read {}: {}", key_path.display(), e))
            })?
            .ok_or_else(|| {
                Error::Handshake(format!("no private key found in {}", key_path.display()))
            })?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
            Error::Handshake(format!("unsupported key in {}: {}", key_path.display(), e))
        })?;

        Ok(CertifiedKey::new(chain, signing_key))
    }

    /// rustls server configuration using this resolver, offering h2 and http/1.1
    pub fn server_config(self: Arc<Self>) -> ServerConfig {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        config
    }

    /// TLS acceptor for the proxy listener
    pub fn acceptor(self: Arc<Self>) -> TlsAcceptor {
        TlsAcceptor::from(Arc::new(self.server_config()))
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let Some(domain) = client_hello.server_name() else {
            warn!("TLS handshake without SNI rejected");
            return None;
        };

        match self.load(domain) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("certs_dir", &self.certs_dir)
            .field("cached", &self.cache.len())
            .finish()
    }
}
