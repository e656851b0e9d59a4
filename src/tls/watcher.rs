use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ProxError, Result};
use crate::tls::{load_key_pair, CertStore, PairConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Watches the TLS manifest and keeps the cert store in sync with it: one
/// background watcher per referenced pair, stale ids purged on every
/// manifest reload.
pub struct TlsConfigWatcher {
    path: PathBuf,
    store: Arc<CertStore>,
}

impl TlsConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, store: Arc<CertStore>) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    /// Reconcile the manifest into the store and poll its modification time
    /// until the token is cancelled. Manifest read/parse failures are fatal
    /// and reported on the error channel.
    pub async fn run(&self, ctx: CancellationToken, errors: mpsc::Sender<anyhow::Error>) {
        loop {
            let pairs = match self.load_manifest().await {
                Ok(pairs) => pairs,
                Err(e) => {
                    let _ = errors.send(e.into()).await;
                    return;
                }
            };

            let referenced: HashSet<String> = pairs.iter().map(PairConfig::id).collect();
            self.store.retain_referenced(&referenced);

            for pair in pairs {
                if !self.store.contains(&pair.id()) {
                    tokio::spawn(watch_pair(ctx.clone(), self.store.clone(), pair));
                }
            }
            info!("successfully configured tls certificates");

            let last_modified = match modification_time(&self.path).await {
                Ok(modified) => modified,
                Err(e) => {
                    error!("could not stat tls config file: {e}");
                    return;
                }
            };

            loop {
                if ctx.is_cancelled() {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;

                match modification_time(&self.path).await {
                    Ok(modified) if modified != last_modified => {
                        info!("tls configuration file update noticed, will reload");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("could not stat tls config file: {e}");
                        return;
                    }
                }
            }
        }
    }

    async fn load_manifest(&self) -> Result<Vec<PairConfig>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let pairs: Vec<PairConfig> = serde_yaml::from_str(&content)?;
        debug!("parsed tls config file {:?}: {:?}", self.path, pairs);
        Ok(pairs)
    }
}

/// Load one pair into the store, then watch both files. An mtime change
/// reloads the pair, a vanished file removes it, and a store purge (manifest
/// reload dropped the pair) ends the watcher so the slot can be reclaimed.
async fn watch_pair(ctx: CancellationToken, store: Arc<CertStore>, pair: PairConfig) {
    let id = pair.id();
    let cert_path = PathBuf::from(&pair.certificate);
    let key_path = PathBuf::from(&pair.key);

    'reload: loop {
        let key = match load_key_pair(&cert_path, &key_path).await {
            Ok(key) => key,
            Err(e) => {
                error!("could not load tls key pair \"{id}\": {e}");
                return;
            }
        };
        store.insert(id.clone(), key);
        debug!("loaded tls key pair \"{id}\"");

        let cert_modified = match modification_time(&cert_path).await {
            Ok(modified) => modified,
            Err(e) => {
                error!("could not stat certificate \"{}\": {e}", pair.certificate);
                return;
            }
        };
        let key_modified = match modification_time(&key_path).await {
            Ok(modified) => modified,
            Err(e) => {
                error!("could not stat key \"{}\": {e}", pair.key);
                return;
            }
        };

        loop {
            if ctx.is_cancelled() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            match modification_time(&cert_path).await {
                Ok(modified) if modified != cert_modified => continue 'reload,
                Ok(_) => {}
                Err(e) => {
                    error!("could not stat certificate \"{}\": {e}", pair.certificate);
                    if is_not_found(&e) {
                        store.remove(&id);
                        return;
                    }
                }
            }

            match modification_time(&key_path).await {
                Ok(modified) if modified != key_modified => continue 'reload,
                Ok(_) => {}
                Err(e) => {
                    error!("could not stat key \"{}\": {e}", pair.key);
                    if is_not_found(&e) {
                        store.remove(&id);
                        return;
                    }
                }
            }

            if !store.contains(&id) {
                return;
            }
        }
    }
}

async fn modification_time(path: &Path) -> Result<SystemTime> {
    Ok(tokio::fs::metadata(path).await?.modified()?)
}

fn is_not_found(err: &ProxError) -> bool {
    matches!(err, ProxError::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_self_signed(dir: &Path, name: &str) -> PairConfig {
        let certified = rcgen::generate_simple_self_signed(vec![format!("{name}.test")]).unwrap();
        let cert_path = dir.join(format!("{name}.crt"));
        let key_path = dir.join(format!("{name}.key"));
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        PairConfig {
            certificate: cert_path.to_string_lossy().into_owned(),
            key: key_path.to_string_lossy().into_owned(),
        }
    }

    fn manifest_yaml(pairs: &[&PairConfig]) -> String {
        pairs
            .iter()
            .map(|p| format!("- certificate: {}\n  key: {}\n", p.certificate, p.key))
            .collect()
    }

    #[tokio::test]
    async fn loads_pairs_and_purges_unreferenced_ones() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_self_signed(dir.path(), "first");
        let second = write_self_signed(dir.path(), "second");

        let manifest = dir.path().join("tls.yaml");
        std::fs::write(&manifest, manifest_yaml(&[&first, &second])).unwrap();

        let store = Arc::new(CertStore::new());
        let watcher = Arc::new(TlsConfigWatcher::new(&manifest, store.clone()));
        let ctx = CancellationToken::new();
        let (err_tx, _err_rx) = mpsc::channel(1);

        let task = {
            let watcher = watcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { watcher.run(ctx, err_tx).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.contains(&first.id()));
        assert!(store.contains(&second.id()));

        // Drop the second pair from the manifest; its id must disappear.
        tokio::fs::write(&manifest, manifest_yaml(&[&first]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.contains(&first.id()));
        assert!(!store.contains(&second.id()));

        ctx.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn a_deleted_certificate_removes_its_pair() {
        let dir = tempfile::tempdir().unwrap();
        let pair = write_self_signed(dir.path(), "gone");

        let store = Arc::new(CertStore::new());
        let ctx = CancellationToken::new();
        let task = tokio::spawn(watch_pair(ctx.clone(), store.clone(), pair.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.contains(&pair.id()));

        tokio::fs::remove_file(&pair.certificate).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!store.contains(&pair.id()));

        ctx.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn an_unreadable_manifest_reports_on_the_error_channel() {
        let store = Arc::new(CertStore::new());
        let watcher = TlsConfigWatcher::new("/nonexistent/tls.yaml", store);
        let ctx = CancellationToken::new();
        let (err_tx, mut err_rx) = mpsc::channel(1);

        watcher.run(ctx, err_tx).await;
        assert!(err_rx.recv().await.is_some());
    }
}
