//! The reference helper: append-only pack synchronization.
//!
//! Each push uploads one encrypted packfile whose plaintext starts with a
//! JSON header naming the branches it advances, followed by a thin pack.
//! Synchronization downloads every pack we have not ingested yet, in
//! global-index order, and folds the headers into the refdb. The merged
//! `latest/` view is computed per branch from the ancestor relation; a
//! branch with no single newest commit is disputed and withheld.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::prelude::{split_path, Clerk};

use crate::git::GitOps;
use crate::protocol::{FetchRef, ListRef, PushRef, PushStatus, RemoteHelper};
use crate::refdb::RefDb;
use crate::refs::{
    decode_infix, decode_pseudo_ref, encode_infix, encode_pseudo_ref, LATEST_DEVICE,
};

/// Pack header format version.
pub const PACK_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackHeader {
    pub version: u32,
    /// branch -> commit
    pub branches: BTreeMap<String, String>,
}

pub struct RefHelper<G: GitOps> {
    clerk: Arc<Clerk>,
    git: G,
    git_dir: PathBuf,
    remote: String,
    refdb: Option<RefDb>,
}

impl<G: GitOps> RefHelper<G> {
    pub fn new(clerk: Clerk, git: G, git_dir: PathBuf, remote: String) -> Self {
        Self {
            clerk: Arc::new(clerk),
            git,
            git_dir,
            remote,
            refdb: None,
        }
    }

    fn refdb(&self) -> Result<&RefDb> {
        self.refdb
            .as_ref()
            .context("internal error: refdb should not have been unloaded")
    }

    /// Download and ingest every pack we have not seen yet.
    pub async fn synch(&mut self) -> Result<()> {
        let mut fresh = false;
        let db = match RefDb::load(&self.git_dir, &self.remote).await? {
            Some(db) => db,
            None => {
                tracing::info!("initializing new local refdb");
                fresh = true;
                RefDb::default()
            }
        };
        self.refdb = Some(db);
        let to_download = self.list_downloads().await?;
        for pack_path in to_download {
            let device = split_path(&pack_path)?.0.to_string();
            let header = self.download_and_unpack(&pack_path).await?;
            self.update_from_header(&device, &pack_path, &header).await?;
        }
        if self.refdb()?.merged_packs.is_empty() {
            tracing::info!("remote is empty; ignoring");
        }
        // pack ingestion persists as it goes; a brand-new empty refdb still
        // needs to reach disk once
        if fresh && self.refdb()?.merged_packs.is_empty() {
            self.refdb()?.save(&self.git_dir, &self.remote).await?;
        }
        Ok(())
    }

    /// List the bucket and pick out the packs missing from the refdb,
    /// ordered by global index.
    async fn list_downloads(&self) -> Result<Vec<String>> {
        let objects = self.clerk.list_objects().await?;
        let mut to_download: HashSet<String> = objects.into_iter().collect();
        for pack in &self.refdb()?.merged_packs {
            if !to_download.remove(pack) {
                bail!("the pack {pack:?} that we previously downloaded is gone");
            }
        }
        let mut ordered = Vec::new();
        for download in to_download {
            let infix = split_path(&download)?.1;
            // skip other kinds of stored data, such as blob uploads
            if let Some((_, global_index)) = decode_infix(infix)? {
                ordered.push((global_index, download));
            }
        }
        ordered.sort();
        Ok(ordered.into_iter().map(|(_, path)| path).collect())
    }

    async fn download_and_unpack(&self, pack_path: &str) -> Result<PackHeader> {
        tracing::info!("downloading and unpacking {pack_path:?}");
        let reader = self.clerk.get_decrypt(pack_path).await?;
        let git = self.git.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = BufReader::new(reader);
            let mut line = Vec::new();
            buf.read_until(b'\n', &mut line)?;
            if line.last() != Some(&b'\n') {
                bail!("unexpected end of pack while reading header");
            }
            let header: PackHeader =
                serde_json::from_slice(&line).context("while parsing pack header")?;
            if header.version != PACK_VERSION {
                bail!(
                    "version mismatch: {} instead of {}",
                    header.version,
                    PACK_VERSION
                );
            }
            git.unpack(&mut buf)?;
            Ok(header)
        })
        .await?
    }

    /// Record an ingested pack and persist the refdb.
    async fn update_from_header(
        &mut self,
        device: &str,
        pack_path: &str,
        header: &PackHeader,
    ) -> Result<()> {
        if device == LATEST_DEVICE {
            bail!("invalid device name");
        }
        let db = self
            .refdb
            .as_mut()
            .context("internal error: refdb should not have been unloaded")?;
        db.merged_packs.push(pack_path.to_string());
        let branches = db.device_branches.entry(device.to_string()).or_default();
        for (branch, commit) in &header.branches {
            branches.insert(branch.clone(), commit.clone());
        }
        self.refdb()?.save(&self.git_dir, &self.remote).await
    }

    /// Resolve a set of competing branch heads to the newest one, or
    /// `None` if the branch is disputed (no commit descends from all the
    /// others).
    async fn merge_commits(&self, commits: &[String]) -> Result<Option<String>> {
        let mut proposed = commits[0].clone();
        for commit in &commits[1..] {
            if self.git.is_ancestor(&proposed, commit).await? {
                // the new commit descends from the proposal and takes precedence
                proposed = commit.clone();
                continue;
            }
            if self.git.is_ancestor(commit, &proposed).await? {
                continue;
            }
            return Ok(None);
        }
        Ok(Some(proposed))
    }

    async fn list_refs(&mut self) -> Result<Vec<ListRef>> {
        self.synch().await?;
        let device_branches = self.refdb()?.device_branches.clone();
        let mut refs = Vec::new();
        let mut competitors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (device, branches) in &device_branches {
            if device == LATEST_DEVICE {
                bail!("unexpectedly encountered merge device in branches list");
            }
            for (branch, commit) in branches {
                refs.push(ListRef {
                    commit: commit.clone(),
                    name: encode_pseudo_ref(device, branch)?,
                });
                competitors
                    .entry(encode_pseudo_ref(LATEST_DEVICE, branch)?)
                    .or_default()
                    .push(commit.clone());
            }
        }
        let head_ref = encode_pseudo_ref(LATEST_DEVICE, "main")?;
        let mut has_head = false;
        for (merge_ref, commits) in &competitors {
            let Some(commit) = self.merge_commits(commits).await? else {
                tracing::warn!("removing disputed branch {merge_ref:?} from latest");
                continue;
            };
            if *merge_ref == head_ref {
                has_head = true;
            }
            refs.push(ListRef {
                commit,
                name: merge_ref.clone(),
            });
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        if has_head {
            refs.push(ListRef {
                commit: format!("@{head_ref}"),
                name: "HEAD".to_string(),
            });
        }
        Ok(refs)
    }

    /// All the actual downloading happened during list; just check that
    /// the requested refs are consistent with the refdb and unpacked.
    async fn fetch_refs(&self, refs: &[FetchRef]) -> Result<()> {
        let db = self.refdb.as_ref().context("list required before fetch")?;
        for r in refs {
            let (device, branch) = decode_pseudo_ref(&r.name)?;
            let acceptable = if device == LATEST_DEVICE {
                // approximate: the merged commit always equals some
                // device's current head for the branch
                db.device_branches
                    .values()
                    .any(|branches| branches.get(&branch) == Some(&r.commit))
            } else {
                db.device_branches
                    .get(&device)
                    .and_then(|branches| branches.get(&branch))
                    == Some(&r.commit)
            };
            if !acceptable {
                bail!(
                    "requested ref not found in refdb: {:?} -> {:?}",
                    r.name,
                    r.commit
                );
            }
            let object_type = self.git.object_type(&r.commit).await?;
            if object_type != "commit" {
                bail!("did not find expected unpacked object: {object_type:?} instead of commit");
            }
        }
        Ok(())
    }

    /// Pick the infix for our next pack.
    ///
    /// Device indices must be contiguous from 0 for our own device; the
    /// global index is one past the highest seen anywhere.
    fn next_pack_name(&self, device_name: &str) -> Result<String> {
        let db = self.refdb()?;
        let mut next_device_index = 0u64;
        let mut next_global_index = 0u64;
        let mut observed = BTreeSet::new();
        for name in &db.merged_packs {
            let (device, infix, _) = split_path(name)?;
            let Some((device_index, global_index)) = decode_infix(infix)? else {
                bail!("detected an improper previous download of non-push infix {infix:?}");
            };
            if device == device_name {
                if !observed.insert(device_index) {
                    bail!("duplicate pack previously pushed with sequence number {device_index}");
                }
                next_device_index = next_device_index.max(device_index + 1);
            }
            next_global_index = next_global_index.max(global_index + 1);
        }
        for i in 0..next_device_index {
            if !observed.contains(&i) {
                bail!("non-contiguous sequence numbers detected: {observed:?}");
            }
        }
        Ok(encode_infix(next_device_index, next_global_index))
    }

    async fn prepare_push(
        &self,
        device_name: &str,
        refs: &[PushRef],
    ) -> Result<(PackHeader, String)> {
        let db = self.refdb.as_ref().context("list required before push")?;
        let mut branches: BTreeMap<String, String> = BTreeMap::new();
        let mut plan = String::new();
        for r in refs {
            let (device, branch) = decode_pseudo_ref(&r.dest)?;
            // a push to the merged namespace lands in our own namespace
            if device != LATEST_DEVICE && device != device_name {
                bail!(
                    "attempt to push to branch {:?} ({:?} {:?}) from device {:?}",
                    r.dest,
                    device,
                    branch,
                    device_name
                );
            }
            let commit = self.git.rev_parse(&r.source).await?;
            if let Some(previous) = branches.get(&branch) {
                if !self.git.is_ancestor(previous, &commit).await? {
                    if r.force {
                        tracing::warn!("rewinding history during force-push to {branch:?}");
                    } else {
                        bail!(
                            "non-force push {branch:?} from {previous:?} to {commit:?} would have rewound history"
                        );
                    }
                }
            }
            plan.push_str(&commit);
            plan.push('\n');
            branches.insert(branch, commit);
        }
        // exclude everything already uploaded by any device, de-duplicated
        let mut known = HashSet::new();
        for device_branches in db.device_branches.values() {
            for commit in device_branches.values() {
                if known.insert(commit.as_str()) {
                    plan.push('^');
                    plan.push_str(commit);
                    plan.push('\n');
                }
            }
        }
        Ok((
            PackHeader {
                version: PACK_VERSION,
                branches,
            },
            plan,
        ))
    }

    async fn push_refs(&mut self, refs: &[PushRef]) -> Result<Vec<PushStatus>> {
        let device_name = self.clerk.device_name().to_string();
        let (header, plan) = self.prepare_push(&device_name, refs).await?;
        let infix = self.next_pack_name(&device_name)?;
        let mut payload = serde_json::to_vec(&header)?;
        payload.push(b'\n');
        let pack = self.git.pack_stream(plan)?;
        let source = std::io::Cursor::new(payload).chain(pack);
        let created = self.clerk.put_encrypt(&infix, source).await?;
        if created.is_empty() {
            bail!("invalid empty created filename");
        }
        // mark as merged so the next sync does not re-download our own upload
        self.update_from_header(&device_name, &created, &header)
            .await?;
        Ok(vec![None; refs.len()])
    }
}

#[async_trait]
impl<G: GitOps> RemoteHelper for RefHelper<G> {
    async fn list(&mut self) -> Result<Vec<ListRef>> {
        self.list_refs().await
    }

    async fn list_for_push(&mut self) -> Result<Vec<ListRef>> {
        self.list_refs().await
    }

    async fn fetch(&mut self, refs: &[FetchRef]) -> Result<()> {
        self.fetch_refs(refs).await
    }

    async fn push(&mut self, refs: &[PushRef]) -> Result<Vec<PushStatus>> {
        self.push_refs(refs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockGit;
    use common::prelude::{Clerk, ClerkConfig};

    fn test_clerk(device: &str) -> Clerk {
        Clerk::new(ClerkConfig {
            secret_key: "test secret".into(),
            work_factor: 2,
            broker_url: "https://broker.invalid".into(),
            bucket_prefix: "https://bucket.invalid/".into(),
            device_name: device.into(),
            device_token: "token".into(),
        })
    }

    fn helper_with_refdb(device: &str, git: MockGit, db: RefDb) -> RefHelper<MockGit> {
        let mut helper = RefHelper::new(
            test_clerk(device),
            git,
            PathBuf::from("/nonexistent"),
            "origin".to_string(),
        );
        helper.refdb = Some(db);
        helper
    }

    fn sha(c: char) -> String {
        c.to_string().repeat(40)
    }

    fn pack_path(device: &str, device_index: u64, global_index: u64) -> String {
        format!(
            "{device}/push-{device_index}-{global_index}#{}",
            "f".repeat(64)
        )
    }

    fn permutations3(items: [String; 3]) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for i in 0..3 {
            for j in 0..3 {
                if j == i {
                    continue;
                }
                let k = 3 - i - j;
                out.push(vec![
                    items[i].clone(),
                    items[j].clone(),
                    items[k].clone(),
                ]);
            }
        }
        out
    }

    #[tokio::test]
    async fn merge_commits_prefers_descendants() {
        let git = MockGit::new();
        git.add_ancestor(&sha('a'), &sha('b'));
        git.add_ancestor(&sha('a'), &sha('c'));
        git.add_ancestor(&sha('b'), &sha('c'));
        let helper = helper_with_refdb("d1", git, RefDb::default());

        // any permutation of a linear chain resolves to the tip
        for perm in permutations3([sha('a'), sha('b'), sha('c')]) {
            let merged = helper.merge_commits(&perm).await.unwrap();
            assert_eq!(merged, Some(sha('c')), "permutation {perm:?}");
        }
    }

    #[tokio::test]
    async fn merge_commits_reports_dispute() {
        let git = MockGit::new();
        git.add_ancestor(&sha('a'), &sha('b'));
        git.add_ancestor(&sha('a'), &sha('c'));
        // b and c are siblings: disputed, in either order
        let helper = helper_with_refdb("d1", git, RefDb::default());
        assert_eq!(
            helper.merge_commits(&[sha('b'), sha('c')]).await.unwrap(),
            None
        );
        assert_eq!(
            helper.merge_commits(&[sha('c'), sha('b')]).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn next_pack_name_starts_from_zero() {
        let helper = helper_with_refdb("d1", MockGit::new(), RefDb::default());
        assert_eq!(helper.next_pack_name("d1").unwrap(), "push-0-0");
    }

    #[tokio::test]
    async fn next_pack_name_advances_both_indices() {
        let mut db = RefDb::default();
        db.merged_packs.push(pack_path("d1", 0, 0));
        db.merged_packs.push(pack_path("d2", 0, 1));
        db.merged_packs.push(pack_path("d1", 1, 2));
        let helper = helper_with_refdb("d1", MockGit::new(), db);
        assert_eq!(helper.next_pack_name("d1").unwrap(), "push-2-3");
    }

    #[tokio::test]
    async fn next_pack_name_rejects_gap() {
        let mut db = RefDb::default();
        db.merged_packs.push(pack_path("d1", 0, 0));
        db.merged_packs.push(pack_path("d1", 2, 1));
        let helper = helper_with_refdb("d1", MockGit::new(), db);
        let err = helper.next_pack_name("d1").unwrap_err();
        assert!(err.to_string().contains("non-contiguous"), "{err}");
    }

    #[tokio::test]
    async fn next_pack_name_rejects_duplicate_device_index() {
        let mut db = RefDb::default();
        db.merged_packs.push(pack_path("d1", 0, 0));
        db.merged_packs.push(pack_path("d1", 0, 1));
        let helper = helper_with_refdb("d1", MockGit::new(), db);
        let err = helper.next_pack_name("d1").unwrap_err();
        assert!(err.to_string().contains("duplicate pack"), "{err}");
    }

    #[tokio::test]
    async fn next_pack_name_rejects_non_push_infix() {
        let mut db = RefDb::default();
        db.merged_packs
            .push(format!("d1/upload-abc#{}", "f".repeat(64)));
        let helper = helper_with_refdb("d1", MockGit::new(), db);
        assert!(helper.next_pack_name("d1").is_err());
    }

    #[tokio::test]
    async fn prepare_push_rejects_foreign_namespace() {
        let helper = helper_with_refdb("d1", MockGit::new(), RefDb::default());
        let err = helper
            .prepare_push(
                "d1",
                &[PushRef {
                    force: false,
                    source: sha('a'),
                    dest: "refs/heads/d2/main".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("attempt to push"), "{err}");
    }

    #[tokio::test]
    async fn prepare_push_latest_lands_in_own_namespace() {
        let helper = helper_with_refdb("d1", MockGit::new(), RefDb::default());
        let (header, plan) = helper
            .prepare_push(
                "d1",
                &[PushRef {
                    force: false,
                    source: sha('a'),
                    dest: "refs/heads/latest/main".into(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(header.branches.get("main"), Some(&sha('a')));
        assert_eq!(plan, format!("{}\n", sha('a')));
    }

    #[tokio::test]
    async fn prepare_push_requires_force_for_rewind() {
        let git = MockGit::new();
        // b descends from a; pushing main=b then main=a rewinds
        git.add_ancestor(&sha('a'), &sha('b'));
        let helper = helper_with_refdb("d1", git.clone(), RefDb::default());
        let refs = |force| {
            vec![
                PushRef {
                    force: false,
                    source: sha('b'),
                    dest: "refs/heads/d1/main".into(),
                },
                PushRef {
                    force,
                    source: sha('a'),
                    dest: "refs/heads/d1/main".into(),
                },
            ]
        };
        let err = helper.prepare_push("d1", &refs(false)).await.unwrap_err();
        assert!(err.to_string().contains("would have rewound"), "{err}");

        let (header, _) = helper.prepare_push("d1", &refs(true)).await.unwrap();
        assert_eq!(header.branches.get("main"), Some(&sha('a')));
    }

    #[tokio::test]
    async fn prepare_push_excludes_known_commits_once() {
        let mut db = RefDb::default();
        db.device_branches.insert(
            "d1".into(),
            BTreeMap::from([("main".to_string(), sha('a'))]),
        );
        db.device_branches.insert(
            "d2".into(),
            BTreeMap::from([("main".to_string(), sha('a'))]),
        );
        let helper = helper_with_refdb("d1", MockGit::new(), db);
        let (_, plan) = helper
            .prepare_push(
                "d1",
                &[PushRef {
                    force: false,
                    source: sha('b'),
                    dest: "refs/heads/d1/main".into(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(plan, format!("{}\n^{}\n", sha('b'), sha('a')));
    }

    #[tokio::test]
    async fn fetch_validates_against_refdb() {
        let mut db = RefDb::default();
        db.device_branches.insert(
            "d1".into(),
            BTreeMap::from([("main".to_string(), sha('a'))]),
        );
        let git = MockGit::new();
        let helper = helper_with_refdb("d2", git.clone(), db);

        helper
            .fetch_refs(&[FetchRef {
                commit: sha('a'),
                name: "refs/heads/d1/main".into(),
            }])
            .await
            .unwrap();
        // the merged view is acceptable when it matches some device head
        helper
            .fetch_refs(&[FetchRef {
                commit: sha('a'),
                name: "refs/heads/latest/main".into(),
            }])
            .await
            .unwrap();
        assert!(helper
            .fetch_refs(&[FetchRef {
                commit: sha('b'),
                name: "refs/heads/d1/main".into(),
            }])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fetch_requires_commit_objects() {
        let mut db = RefDb::default();
        db.device_branches.insert(
            "d1".into(),
            BTreeMap::from([("main".to_string(), sha('a'))]),
        );
        let git = MockGit::new();
        git.set_object_type(&sha('a'), "blob");
        let helper = helper_with_refdb("d2", git, db);
        let err = helper
            .fetch_refs(&[FetchRef {
                commit: sha('a'),
                name: "refs/heads/d1/main".into(),
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("instead of commit"), "{err}");
    }
}
