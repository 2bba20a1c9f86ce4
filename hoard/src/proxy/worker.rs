//! Target registry, prefix routing and garbage-collection entry points.

use crate::proxy::target::{Target, TargetConfig};
use crate::proxy::Error;
use crate::store::blob::BlobStore;
use crate::store::meta::MetaStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Registry {
    targets: std::collections::HashMap<String, Arc<Target>>,
    /// Registered prefixes, longest first, so the most specific target wins.
    sorted_prefixes: Vec<String>,
}

/// Owns the shared blob store and the bound targets.
///
/// Binding happens at startup; after that the worker only routes, sweeps and
/// eventually closes.
pub struct Worker {
    base_dir: PathBuf,
    blobs: Arc<BlobStore>,
    registry: RwLock<Registry>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Opens the storage under `base_dir` and cleans up staging leftovers
    /// from a previous hard kill.
    pub fn open(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        let blobs = Arc::new(BlobStore::open(&base_dir)?);
        match blobs.clean_leftover_staging() {
            Ok(0) => {}
            Ok(count) => info!(count, "removed leftover staging files"),
            Err(err) => warn!(error = %err, "staging cleanup failed"),
        }
        Ok(Worker {
            base_dir,
            blobs,
            registry: RwLock::new(Registry::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers `config` as the target serving `/name/`.
    pub fn bind(&self, name: &str, config: TargetConfig) -> Result<(), Error> {
        let name = name.trim_matches('/');
        let prefix = format!("/{name}/");
        let meta = MetaStore::open(self.base_dir.join("meta").join(name))?;
        let target = Arc::new(Target::bind(name, config, meta, self.blobs.clone())?);

        let mut registry = self.registry.write().unwrap();
        if registry.targets.contains_key(&prefix) {
            return Err(Error::DuplicateTarget(name.to_owned()));
        }
        registry.targets.insert(prefix.clone(), target);
        registry.sorted_prefixes.push(prefix);
        registry.sorted_prefixes.sort();
        registry.sorted_prefixes.reverse();
        Ok(())
    }

    /// Resolves `request_uri` to its target and the child path below the
    /// target's prefix. The longest registered prefix wins.
    pub fn route(&self, request_uri: &str) -> Option<(Arc<Target>, String)> {
        let registry = self.registry.read().unwrap();
        for prefix in &registry.sorted_prefixes {
            if let Some(child) = request_uri.strip_prefix(prefix) {
                let target = registry.targets[prefix].clone();
                return Some((target, child.to_owned()));
            }
        }
        None
    }

    /// Names of the bound targets, for the index page.
    pub fn target_names(&self) -> Vec<String> {
        let registry = self.registry.read().unwrap();
        let mut names: Vec<String> = registry
            .targets
            .values()
            .map(|target| target.name().to_owned())
            .collect();
        names.sort();
        names
    }

    /// Runs the meta sweep of every target; failures are logged so one
    /// misbehaving target cannot stall the others.
    pub fn meta_gc(&self) {
        let targets: Vec<Arc<Target>> = {
            let registry = self.registry.read().unwrap();
            registry.targets.values().cloned().collect()
        };
        for target in targets {
            if let Err(err) = target.gc() {
                warn!(name = %target.name(), error = %err, "meta gc failed");
            }
        }
    }

    /// Sweeps unreferenced blobs out of the shared store.
    pub fn blob_gc(&self) {
        match self.blobs.gc() {
            Ok(removed) => {
                if removed > 0 {
                    debug!(removed, "blob gc finished");
                }
            }
            Err(err) => warn!(error = %err, "blob gc failed"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting new work and drains every target's in-flight
    /// requests.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let targets: Vec<Arc<Target>> = {
            let registry = self.registry.read().unwrap();
            registry.targets.values().cloned().collect()
        };
        for target in targets {
            debug!(name = %target.name(), "draining target");
            target.close();
        }
    }
}
