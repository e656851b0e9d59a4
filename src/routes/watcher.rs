use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::has_yaml_extension;
use crate::error::{ProxError, Result};
use crate::routes::{RouteManager, RouteSpec};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Watches the routes YAML file and reconciles its records into the route
/// manager. Reloads are triggered by file modification time changes; routes
/// removed from the file are left in the table until the process restarts.
pub struct RoutesFileWatcher {
    path: PathBuf,
    manager: Arc<RouteManager>,
}

impl RoutesFileWatcher {
    pub fn new(path: impl Into<PathBuf>, manager: Arc<RouteManager>) -> Self {
        Self {
            path: path.into(),
            manager,
        }
    }

    /// Load, reconcile and poll until the token is cancelled. Failures to
    /// open, read or parse the file are fatal and reported on the error
    /// channel; per-route reconcile failures are logged and skipped.
    pub async fn run(&self, ctx: CancellationToken, errors: mpsc::Sender<anyhow::Error>) {
        loop {
            if let Err(e) = self.load_and_reconcile(&ctx).await {
                let _ = errors.send(e.into()).await;
                return;
            }

            let mut last_modified = match modification_time(&self.path).await {
                Ok(t) => t,
                Err(e) => {
                    let _ = errors.send(e.into()).await;
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
                        info!("routes configuration file update noticed, will reload");
                        last_modified = modified;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = errors.send(e.into()).await;
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the file: parse it and create-or-update every record.
    /// A file with duplicated names is logged and skipped entirely so the
    /// existing table stays intact.
    pub(crate) async fn load_and_reconcile(&self, ctx: &CancellationToken) -> Result<()> {
        let specs = self.load_specs().await?;

        if has_duplicates(&specs) {
            return Ok(());
        }

        for spec in specs {
            let name = spec.name.clone();
            match self.manager.create(ctx, spec.clone()).await {
                Ok(()) => {}
                Err(ProxError::AlreadyExists) => {
                    if let Err(e) = self.manager.update(ctx, spec).await {
                        error!("could not update route with name {name}, error: {e}");
                        continue;
                    }
                }
                Err(e) => {
                    error!("could not create route with name {name}, error: {e}");
                    continue;
                }
            }
        }

        info!("successfully configured proxy routes");
        Ok(())
    }

    async fn load_specs(&self) -> Result<Vec<RouteSpec>> {
        if !has_yaml_extension(&self.path) {
            return Err(ProxError::InvalidFileType);
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let specs: Vec<RouteSpec> = serde_yaml::from_str(&content)?;
        debug!("parsed routes config file {:?}: {:?}", self.path, specs);
        Ok(specs)
    }
}

async fn modification_time(path: &Path) -> Result<SystemTime> {
    Ok(tokio::fs::metadata(path).await?.modified()?)
}

/// Log every duplicated route name with its count; a single duplicate makes
/// the whole file unusable for this reload.
pub(crate) fn has_duplicates(specs: &[RouteSpec]) -> bool {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for spec in specs {
        *counts.entry(spec.name.as_str()).or_default() += 1;
    }

    let mut found = false;
    for (name, count) in counts {
        if count > 1 {
            found = true;
            error!("configuration has duplicated route name \"{name}\", count: {count}");
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::MemoryRepository;
    use std::io::Write;

    fn watcher_for(file: &tempfile::NamedTempFile) -> RoutesFileWatcher {
        let manager = Arc::new(RouteManager::with_default_client(MemoryRepository::new()));
        RoutesFileWatcher::new(file.path(), manager)
    }

    fn routes_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const TWO_ROUTES: &str = r#"
- name: r1
  hostname: example.com
  upstream-url: http://127.0.0.1:9000
  port: 8080
- name: r2
  path-regx: /api/.*
  upstream-url: http://127.0.0.1:9001
  port: 8080
"#;

    #[tokio::test]
    async fn reconcile_creates_all_routes() {
        let file = routes_yaml(TWO_ROUTES);
        let watcher = watcher_for(&file);
        let ctx = CancellationToken::new();

        watcher.load_and_reconcile(&ctx).await.unwrap();

        let routes = watcher.manager.list(&ctx).await.unwrap();
        assert_eq!(routes.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_twice_is_a_noop() {
        let file = routes_yaml(TWO_ROUTES);
        let watcher = watcher_for(&file);
        let ctx = CancellationToken::new();

        watcher.load_and_reconcile(&ctx).await.unwrap();
        watcher.load_and_reconcile(&ctx).await.unwrap();

        assert_eq!(watcher.manager.list(&ctx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicated_names_keep_the_existing_table() {
        let file = routes_yaml(TWO_ROUTES);
        let watcher = watcher_for(&file);
        let ctx = CancellationToken::new();
        watcher.load_and_reconcile(&ctx).await.unwrap();

        let duplicated = routes_yaml(
            r#"
- name: r1
  hostname: example.com
  upstream-url: http://127.0.0.1:9100
  port: 8080
- name: r1
  hostname: example.org
  upstream-url: http://127.0.0.1:9101
  port: 8080
"#,
        );
        let second = RoutesFileWatcher::new(duplicated.path(), watcher.manager.clone());
        second.load_and_reconcile(&ctx).await.unwrap();

        let routes = watcher.manager.list(&ctx).await.unwrap();
        assert_eq!(routes.len(), 2);
        let r1 = routes.iter().find(|r| r.name() == "r1").unwrap();
        assert_eq!(r1.upstream().as_str(), "http://127.0.0.1:9000/");
    }

    #[tokio::test]
    async fn one_bad_route_does_not_block_the_rest() {
        let file = routes_yaml(
            r#"
- name: bad
  hostname: "not valid!"
  upstream-url: http://127.0.0.1:9000
- name: good
  hostname: example.com
  upstream-url: http://127.0.0.1:9001
"#,
        );
        let watcher = watcher_for(&file);
        let ctx = CancellationToken::new();

        watcher.load_and_reconcile(&ctx).await.unwrap();

        let routes = watcher.manager.list(&ctx).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name(), "good");
    }

    #[tokio::test]
    async fn rejects_non_yaml_files() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"").unwrap();
        let watcher = watcher_for(&file);

        let err = watcher
            .load_and_reconcile(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxError::InvalidFileType));
    }

    #[tokio::test]
    async fn mtime_change_triggers_a_reload() {
        let file = routes_yaml(TWO_ROUTES);
        let watcher = Arc::new(watcher_for(&file));
        let ctx = CancellationToken::new();
        let (err_tx, _err_rx) = mpsc::channel(1);

        let task = {
            let watcher = watcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { watcher.run(ctx, err_tx).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            watcher.manager.list(&ctx).await.unwrap().len(),
            2,
            "initial load should have happened"
        );

        let updated = format!(
            "{TWO_ROUTES}- name: r3\n  hostname: example.net\n  upstream-url: http://127.0.0.1:9002\n  port: 8080\n"
        );
        tokio::fs::write(file.path(), updated).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(watcher.manager.list(&ctx).await.unwrap().len(), 3);

        ctx.cancel();
        task.await.unwrap();
    }

    #[test]
    fn duplicate_detection() {
        let specs = vec![
            RouteSpec {
                name: "a".into(),
                ..Default::default()
            },
            RouteSpec {
                name: "a".into(),
                ..Default::default()
            },
            RouteSpec {
                name: "b".into(),
                ..Default::default()
            },
        ];
        assert!(has_duplicates(&specs));
        assert!(!has_duplicates(&specs[1..]));
    }
}
