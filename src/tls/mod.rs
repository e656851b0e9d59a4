use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::Deserialize;

use crate::error::{ProxError, Result};

pub mod watcher;

pub use watcher::TlsConfigWatcher;

/// One entry of the TLS manifest: paths to a PEM certificate chain and its
/// private key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PairConfig {
    pub certificate: String,
    pub key: String,
}

impl PairConfig {
    /// Store id derived from the two paths.
    pub fn id(&self) -> String {
        format!("ID_{}_{}", self.certificate, self.key)
    }
}

/// In-memory store of loaded key pairs, shared between the TLS watchers and
/// every TLS listener. Doubles as the SNI resolver: the lock is synchronous
/// because rustls resolves certificates from non-async handshake code.
#[derive(Default)]
pub struct CertStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: String, key: Arc<CertifiedKey>) {
        let mut certs = self.certs.write().unwrap_or_else(PoisonError::into_inner);
        certs.insert(id, key);
    }

    pub fn remove(&self, id: &str) {
        let mut certs = self.certs.write().unwrap_or_else(PoisonError::into_inner);
        certs.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        let certs = self.certs.read().unwrap_or_else(PoisonError::into_inner);
        certs.contains_key(id)
    }

    /// Drop every id that is not in the referenced set. Called when the
    /// manifest is reloaded so removed pairs disappear from handshakes and
    /// their watchers notice and exit.
    pub fn retain_referenced(&self, referenced: &HashSet<String>) {
        let mut certs = self.certs.write().unwrap_or_else(PoisonError::into_inner);
        certs.retain(|id, _| referenced.contains(id));
    }

    pub fn len(&self) -> usize {
        let certs = self.certs.read().unwrap_or_else(PoisonError::into_inner);
        certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore").field("entries", &self.len()).finish()
    }
}

impl ResolvesServerCert for CertStore {
    /// Return the first stored pair whose leaf certificate is valid for the
    /// client's SNI name. Iteration order is unspecified; operators are
    /// expected to supply non-overlapping SANs. A client without SNI gets
    /// whichever entry comes up first.
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let certs = self.certs.read().unwrap_or_else(PoisonError::into_inner);

        let Some(name) = client_hello.server_name() else {
            return certs.values().next().cloned();
        };
        let server_name = ServerName::try_from(name).ok()?;

        certs
            .values()
            .find(|candidate| certificate_matches(candidate, &server_name))
            .cloned()
    }
}

fn certificate_matches(key: &CertifiedKey, server_name: &ServerName<'_>) -> bool {
    let Ok(end_entity) = key.end_entity_cert() else {
        return false;
    };
    let Ok(cert) = webpki::EndEntityCert::try_from(end_entity) else {
        return false;
    };
    cert.verify_is_valid_for_subject_name(server_name).is_ok()
}

/// Load a PEM key pair from disk into a rustls `CertifiedKey`.
pub async fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_bytes = tokio::fs::read(cert_path).await?;
    let key_bytes = tokio::fs::read(key_path).await?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_bytes.as_slice()))
        .collect::<std::io::Result<Vec<CertificateDer<'static>>>>()?;
    if certs.is_empty() {
        return Err(ProxError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_bytes.as_slice()))?
        .ok_or_else(|| {
            ProxError::Tls(format!("no private key found in {}", key_path.display()))
        })?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| ProxError::Tls(e.to_string()))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Server-side TLS config whose certificate selection goes through the live
/// store on every handshake. The crypto provider is pinned explicitly since
/// the dependency graph carries more than one rustls backend.
pub fn server_config(store: Arc<CertStore>) -> Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(store);
    Ok(config)
}
