//! The blob helper: a content-addressed "key to opaque file" API on top
//! of the clerk.
//!
//! Keys map to bucket infixes through the keyed filename MAC, so the
//! bucket operator cannot correlate object names with git-annex keys. The
//! bucket listing is cached; lookups serve data up to
//! [`RESYNC_START_DELAY`] old as-is, kick a background refresh between
//! that and [`RESYNC_PAUSE_DELAY`], and block on a refresh beyond it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use common::prelude::{split_path, Clerk, PlaintextReader};

use crate::key_locks::KeyLocks;
use crate::protocol::{RemoteConfig, Responder, SpecialRemote};
use crate::syncher::Syncher;

/// Beyond this age a lookup kicks a speculative background refresh.
pub const RESYNC_START_DELAY: Duration = Duration::from_secs(10);
/// Beyond this age lookups block on a refresh instead of serving stale
/// data.
pub const RESYNC_PAUSE_DELAY: Duration = Duration::from_secs(30);

const UPLOAD_PREFIX: &str = "upload-";

#[derive(Debug, Clone)]
struct ObjectEntry {
    path: String,
    /// A second bucket path sharing this infix; only the out-of-band
    /// repair tool can reconcile this.
    duplicate: Option<String>,
}

#[derive(Default)]
struct Cache {
    object_map: Arc<HashMap<String, ObjectEntry>>,
    last_refresh: Option<Instant>,
    last_error: Option<String>,
}

struct State {
    clerk: tokio::sync::Mutex<Option<Arc<Clerk>>>,
    cache: Mutex<Cache>,
    syncher: Syncher,
    key_locks: KeyLocks,
}

/// The special remote served over the annex protocol. Cheap to clone;
/// all clones share one clerk, cache, and lock set.
#[derive(Clone)]
pub struct BlobRemote {
    state: Arc<State>,
}

impl Default for BlobRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                clerk: tokio::sync::Mutex::new(None),
                cache: Mutex::new(Cache::default()),
                syncher: Syncher::new(),
                key_locks: KeyLocks::new(),
            }),
        }
    }

    /// Build a remote around an existing clerk, skipping the GETCONFIG
    /// bootstrap. Used by tests.
    pub fn with_clerk(clerk: Clerk) -> Self {
        let remote = Self::new();
        *remote.state.clerk.try_lock().expect("fresh remote") = Some(Arc::new(clerk));
        remote
    }

    /// Resolve the `underlying` git remote to a nightmarket config path
    /// and load a clerk from it.
    async fn load_clerk(&self, r: &mut Responder) -> Result<Clerk> {
        let underlying = r.get_config("underlying").await?;
        if underlying.is_empty() {
            bail!("no 'underlying' setting configured");
        }
        let git_dir = r.get_git_dir().await?;
        if git_dir.is_empty() {
            bail!("invalid empty GIT_DIR setting detected");
        }
        let output = tokio::process::Command::new("git")
            .env("GIT_DIR", &git_dir)
            .args(["remote", "get-url", "--", &underlying])
            .output()
            .await
            .context("while trying to run git remote get-url")?;
        if !output.status.success() {
            bail!("git remote get-url failed with {}", output.status);
        }
        let config_url = String::from_utf8(output.stdout)?.trim().to_string();
        let Some(config_path) = config_url.strip_prefix("nightmarket::") else {
            bail!("invalid URL for nightmarket remote {underlying:?}: {config_url:?}");
        };
        Ok(Clerk::load(Path::new(config_path))?)
    }

    async fn prepare_clerk(&self, r: &mut Responder) -> Result<()> {
        let mut clerk = self.state.clerk.lock().await;
        if clerk.is_none() {
            *clerk = Some(Arc::new(self.load_clerk(r).await?));
        }
        Ok(())
    }

    async fn clerk(&self) -> Result<Arc<Clerk>> {
        self.state
            .clerk
            .lock()
            .await
            .clone()
            .context("clerk not initialized; maybe we didn't get a PREPARE yet")
    }

    fn cache_age(&self) -> Option<Duration> {
        let cache = self.state.cache.lock().unwrap();
        cache.last_refresh.map(|at| at.elapsed())
    }

    /// One full listing pass, publishing a fresh object-map snapshot.
    async fn run_refresh(self) {
        let result = self.refresh_once().await;
        let mut cache = self.state.cache.lock().unwrap();
        match result {
            Ok(map) => {
                cache.object_map = Arc::new(map);
                cache.last_refresh = Some(Instant::now());
                cache.last_error = None;
            }
            Err(e) => {
                tracing::warn!("bucket listing refresh failed: {e:#}");
                cache.last_error = Some(format!("{e:#}"));
            }
        }
    }

    async fn refresh_once(&self) -> Result<HashMap<String, ObjectEntry>> {
        let clerk = self.clerk().await?;
        let objects = clerk.list_objects().await?;
        let mut map = HashMap::new();
        for path in objects {
            let infix = split_path(&path)?.1.to_string();
            match map.entry(infix) {
                Entry::Vacant(vacant) => {
                    vacant.insert(ObjectEntry {
                        path,
                        duplicate: None,
                    });
                }
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if entry.duplicate.is_none() && entry.path != path {
                        entry.duplicate = Some(path);
                    }
                }
            }
        }
        Ok(map)
    }

    fn kick_refresh(&self) {
        let this = self.clone();
        self.state.syncher.kick(this.run_refresh());
    }

    /// Wait for fresh listing data; data younger than
    /// [`RESYNC_START_DELAY`] is already final.
    async fn refresh_blocking(&self) -> Result<()> {
        if matches!(self.cache_age(), Some(age) if age < RESYNC_START_DELAY) {
            return Ok(());
        }
        let this = self.clone();
        self.state.syncher.wait(this.run_refresh()).await;
        let cache = self.state.cache.lock().unwrap();
        if let Some(message) = &cache.last_error {
            bail!("{message}");
        }
        Ok(())
    }

    fn lookup(&self, key: &str, infix: &str) -> Result<Option<String>> {
        let map = self.state.cache.lock().unwrap().object_map.clone();
        match map.get(infix) {
            None => Ok(None),
            Some(entry) => match &entry.duplicate {
                Some(duplicate) => bail!(
                    "detected duplicate files for key {key:?}: {:?} and {:?}",
                    entry.path,
                    duplicate
                ),
                None => Ok(Some(entry.path.clone())),
            },
        }
    }

    /// Find the bucket path for `key`, refreshing the listing as the
    /// staleness policy demands. A miss against fresh data is final.
    async fn locate(&self, key: &str) -> Result<Option<String>> {
        let clerk = self.clerk().await?;
        let infix = format!("{UPLOAD_PREFIX}{}", clerk.hmac(key));
        match self.cache_age() {
            None => self.refresh_blocking().await?,
            Some(age) if age >= RESYNC_PAUSE_DELAY => self.refresh_blocking().await?,
            Some(age) if age >= RESYNC_START_DELAY => self.kick_refresh(),
            _ => {}
        }
        if let Some(path) = self.lookup(key, &infix)? {
            return Ok(Some(path));
        }
        // miss: resync against the remote, and whatever this says is final
        self.refresh_blocking().await?;
        self.lookup(key, &infix)
    }

    /// Record a freshly uploaded object without another round trip. A
    /// racing refresh that already listed it is harmless.
    fn add_object(&self, path: &str) -> Result<()> {
        let infix = split_path(path)?.1.to_string();
        let mut cache = self.state.cache.lock().unwrap();
        let mut map: HashMap<String, ObjectEntry> = (*cache.object_map).clone();
        match map.entry(infix) {
            Entry::Vacant(vacant) => {
                vacant.insert(ObjectEntry {
                    path: path.to_string(),
                    duplicate: None,
                });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.path != path && entry.duplicate.is_none() {
                    entry.duplicate = Some(path.to_string());
                }
            }
        }
        cache.object_map = Arc::new(map);
        Ok(())
    }
}

fn copy_with_progress(
    mut reader: PlaintextReader,
    dest: &str,
    progress: mpsc::UnboundedSender<u64>,
) -> Result<()> {
    let mut out = std::fs::File::create(dest)
        .with_context(|| format!("while creating {dest:?}"))?;
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
        let _ = progress.send(total);
    }
    Ok(())
}

#[async_trait]
impl SpecialRemote for BlobRemote {
    fn negotiate_async(&self) -> bool {
        true
    }

    async fn list_configs(&self) -> Result<Vec<RemoteConfig>> {
        Ok(vec![RemoteConfig {
            name: "underlying".to_string(),
            description: "git remote to retrieve underlying configuration for".to_string(),
        }])
    }

    async fn init_remote(&self, r: &mut Responder) -> Result<()> {
        self.load_clerk(r).await?;
        Ok(())
    }

    async fn prepare(&self, r: &mut Responder) -> Result<()> {
        self.prepare_clerk(r).await?;
        // prime the object map with one listing
        self.refresh_blocking().await
    }

    async fn transfer_store(&self, r: &mut Responder, key: &str, path: &str) -> Result<()> {
        let _guard = self.state.key_locks.acquire(key).await;
        let clerk = self.clerk().await?;
        if let Some(existing) = self.locate(key).await? {
            // already uploaded; storing the same key again is a no-op
            r.debug(&format!("key {key} already stored as {existing}"))
                .await?;
            return Ok(());
        }
        let file = std::fs::File::open(path).with_context(|| format!("while opening {path:?}"))?;
        let infix = format!("{UPLOAD_PREFIX}{}", clerk.hmac(key));
        let created = clerk.put_encrypt(&infix, file).await?;
        self.add_object(&created)?;
        Ok(())
    }

    async fn transfer_retrieve(&self, r: &mut Responder, key: &str, path: &str) -> Result<()> {
        let _guard = self.state.key_locks.acquire(key).await;
        let clerk = self.clerk().await?;
        let Some(object_path) = self.locate(key).await? else {
            bail!("no such key detected in repository during transfer retrieve: {key:?}");
        };
        let reader = clerk.get_decrypt(&object_path).await?;
        let dest = path.to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut copy = tokio::task::spawn_blocking(move || copy_with_progress(reader, &dest, tx));
        loop {
            tokio::select! {
                result = &mut copy => {
                    result??;
                    break;
                }
                Some(total) = rx.recv() => {
                    r.progress(total).await?;
                }
            }
        }
        Ok(())
    }

    async fn check_present(&self, _r: &mut Responder, key: &str) -> Result<bool> {
        let _guard = self.state.key_locks.acquire(key).await;
        Ok(self.locate(key).await?.is_some())
    }

    async fn remove(&self, _r: &mut Responder, _key: &str) -> Result<()> {
        bail!("files cannot be removed from the nightmarket remote (by design)")
    }
}
