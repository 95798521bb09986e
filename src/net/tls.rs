//! TLS context factory.
//!
//! # Responsibilities
//! - Load certificate chain, private key and trust store from PEM files
//! - Apply the configured protocol versions and cipher suites
//! - Produce an ALPN context (`h2`, then `http/1.1`) or a plain one
//! - Cache one acceptor per listener port
//!
//! # Design Decisions
//! - Contexts are built when a listener is registered, so bad material
//!   fails startup instead of the first handshake
//! - Cipher suites are matched by their IANA name, case-insensitively
//! - Encrypted private keys are not supported

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use crate::config::{ClientAuth, ConfigError, ListenerConfiguration, SslConfig};

/// ALPN identifiers advertised by the HTTP/2 context, in preference order.
pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn tls_error(context: &str, detail: impl std::fmt::Display) -> ConfigError {
    ConfigError::Tls(format!("{}: {}", context, detail))
}

fn open(path: &str) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| tls_error(&format!("cannot read {}", path), e))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&format!("invalid certificate PEM in {}", path), e))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| tls_error(&format!("invalid key PEM in {}", path), e))?
        .ok_or_else(|| tls_error(path, "no unencrypted private key found"))
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
    if names.is_empty() {
        return Ok(rustls::DEFAULT_VERSIONS.to_vec());
    }
    names
        .iter()
        .map(|name| match name.to_ascii_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(&rustls::version::TLS12),
            "TLSV1.3" | "TLS1.3" => Ok(&rustls::version::TLS13),
            _ => Err(tls_error("unsupported protocol", name)),
        })
        .collect()
}

fn crypto_provider(cipher_suites: &[String]) -> Result<CryptoProvider, ConfigError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if cipher_suites.is_empty() {
        return Ok(provider);
    }

    let available = std::mem::take(&mut provider.cipher_suites);
    for wanted in cipher_suites {
        let suite = available
            .iter()
            .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(wanted))
            .ok_or_else(|| tls_error("cipher suite unavailable", wanted))?;
        provider.cipher_suites.push(*suite);
    }
    Ok(provider)
}

/// Builds server TLS contexts for one listener.
pub struct TlsContextFactory {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_auth: ClientAuth,
    trust_roots: Option<Arc<RootCertStore>>,
}

impl TlsContextFactory {
    pub fn from_config(ssl: &SslConfig) -> Result<Self, ConfigError> {
        let trust_roots = match &ssl.trust_store_path {
            Some(path) if ssl.client_auth != ClientAuth::None => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_error(&format!("invalid trust anchor in {}", path), e))?;
                }
                Some(Arc::new(roots))
            }
            _ => None,
        };

        Ok(Self {
            provider: Arc::new(crypto_provider(&ssl.cipher_suites)?),
            versions: protocol_versions(&ssl.protocols)?,
            certs: load_certs(&ssl.cert_path)?,
            key: load_key(&ssl.key_path)?,
            client_auth: ssl.client_auth,
            trust_roots,
        })
    }

    /// Server config with or without ALPN.
    pub fn server_config(&self, alpn: bool) -> Result<Arc<ServerConfig>, ConfigError> {
        let builder = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)
            .map_err(|e| tls_error("protocol/cipher combination rejected", e))?;

        let builder = match (self.client_auth, &self.trust_roots) {
            (ClientAuth::None, _) | (_, None) => builder.with_no_client_auth(),
            (mode, Some(roots)) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), self.provider.clone());
                let verifier = if mode == ClientAuth::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| tls_error("client verifier", e))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| tls_error("certificate/key rejected", e))?;
        if alpn {
            config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
        }
        Ok(Arc::new(config))
    }

    /// ALPN-capable context advertising `h2` then `http/1.1`.
    pub fn create_http2_tls_context(&self) -> Result<TlsAcceptor, ConfigError> {
        Ok(TlsAcceptor::from(self.server_config(true)?))
    }

    /// Plain context; the connection is HTTP/1.1 once the handshake completes.
    pub fn create(&self) -> Result<TlsAcceptor, ConfigError> {
        Ok(TlsAcceptor::from(self.server_config(false)?))
    }
}

/// TLS acceptors by listener port.
#[derive(Default)]
pub struct TlsAcceptorCache {
    acceptors: DashMap<u16, TlsAcceptor>,
}

impl TlsAcceptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or drop) the acceptor for `listener` according to its ssl config.
    pub fn prepare(&self, listener: &ListenerConfiguration) -> Result<(), ConfigError> {
        let Some(ssl) = &listener.ssl_config else {
            self.acceptors.remove(&listener.port);
            return Ok(());
        };

        let factory = TlsContextFactory::from_config(ssl)?;
        let acceptor = if listener.http2_tls {
            factory.create_http2_tls_context()?
        } else {
            factory.create()?
        };
        self.acceptors.insert(listener.port, acceptor);

        tracing::debug!(
            listener_id = %listener.id,
            port = listener.port,
            alpn = listener.http2_tls,
            client_auth = ?ssl.client_auth,
            "TLS context prepared"
        );
        Ok(())
    }

    pub fn get(&self, port: u16) -> Option<TlsAcceptor> {
        self.acceptors.get(&port).map(|a| a.value().clone())
    }

    pub fn remove(&self, port: u16) {
        self.acceptors.remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_material(dir: &Path) -> SslConfig {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        SslConfig {
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
            cipher_suites: Vec::new(),
            protocols: Vec::new(),
            client_auth: ClientAuth::None,
            trust_store_path: None,
        }
    }

    #[test]
    fn alpn_context_advertises_h2_first() {
        let dir = tempfile::tempdir().unwrap();
        let factory = TlsContextFactory::from_config(&write_material(dir.path())).unwrap();

        let alpn = factory.server_config(true).unwrap();
        assert_eq!(alpn.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let plain = factory.server_config(false).unwrap();
        assert!(plain.alpn_protocols.is_empty());
    }

    #[test]
    fn missing_key_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ssl = write_material(dir.path());
        ssl.key_path = dir.path().join("absent.pem").to_string_lossy().into_owned();

        assert!(matches!(TlsContextFactory::from_config(&ssl), Err(ConfigError::Tls(_))));
    }

    #[test]
    fn unknown_cipher_suite_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ssl = write_material(dir.path());
        ssl.cipher_suites = vec!["TLS_RSA_WITH_RC4_128_MD5".into()];

        assert!(matches!(TlsContextFactory::from_config(&ssl), Err(ConfigError::Tls(_))));
    }

    #[test]
    fn named_suites_and_versions_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut ssl = write_material(dir.path());
        ssl.cipher_suites = vec!["tls13_aes_128_gcm_sha256".into()];
        ssl.protocols = vec!["TLSv1.3".into()];

        let factory = TlsContextFactory::from_config(&ssl).unwrap();
        assert_eq!(factory.provider.cipher_suites.len(), 1);
        assert_eq!(factory.versions.len(), 1);
        assert!(factory.create().is_ok());

        ssl.protocols = vec!["SSLv3".into()];
        assert!(TlsContextFactory::from_config(&ssl).is_err());
    }

    #[test]
    fn cache_tracks_tls_listeners_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TlsAcceptorCache::new();

        let tls = ListenerConfiguration {
            port: 8443,
            ssl_config: Some(write_material(dir.path())),
            http2_tls: true,
            ..Default::default()
        };
        cache.prepare(&tls).unwrap();
        assert!(cache.get(8443).is_some());

        let cleartext = ListenerConfiguration { port: 8443, ..Default::default() };
        cache.prepare(&cleartext).unwrap();
        assert!(cache.get(8443).is_none());
    }
}
