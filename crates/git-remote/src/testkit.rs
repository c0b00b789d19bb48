//! Scripted stand-ins for the git subprocess.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::git::GitOps;

/// A scripted ancestor oracle and pack sink/source.
///
/// `rev_parse` resolves scripted names and passes 40-hex ids through;
/// `object_type` defaults to `commit`; `is_ancestor` is reflexive plus
/// whatever edges the test added (add transitive pairs explicitly).
#[derive(Clone, Default)]
pub struct MockGit {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    ancestors: Mutex<HashSet<(String, String)>>,
    object_types: Mutex<HashMap<String, String>>,
    resolved: Mutex<HashMap<String, String>>,
    unpacked: Mutex<Vec<Vec<u8>>>,
    plans: Mutex<Vec<String>>,
    pack_output: Mutex<Vec<u8>>,
}

impl MockGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ancestor(&self, ancestor: &str, descendant: &str) {
        self.inner
            .ancestors
            .lock()
            .unwrap()
            .insert((ancestor.to_string(), descendant.to_string()));
    }

    pub fn set_resolve(&self, rev: &str, commit: &str) {
        self.inner
            .resolved
            .lock()
            .unwrap()
            .insert(rev.to_string(), commit.to_string());
    }

    pub fn set_object_type(&self, id: &str, object_type: &str) {
        self.inner
            .object_types
            .lock()
            .unwrap()
            .insert(id.to_string(), object_type.to_string());
    }

    pub fn set_pack_output(&self, bytes: &[u8]) {
        *self.inner.pack_output.lock().unwrap() = bytes.to_vec();
    }

    /// Everything fed through `unpack`, in order.
    pub fn unpacked(&self) -> Vec<Vec<u8>> {
        self.inner.unpacked.lock().unwrap().clone()
    }

    /// Every rev plan handed to `pack_stream`, in order.
    pub fn plans(&self) -> Vec<String> {
        self.inner.plans.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitOps for MockGit {
    async fn rev_parse(&self, rev: &str) -> Result<String> {
        if let Some(commit) = self.inner.resolved.lock().unwrap().get(rev) {
            return Ok(commit.clone());
        }
        if rev.len() == 40 && rev.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Ok(rev.to_string());
        }
        bail!("unknown rev {rev:?}");
    }

    async fn object_type(&self, id: &str) -> Result<String> {
        Ok(self
            .inner
            .object_types
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| "commit".to_string()))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self
            .inner
            .ancestors
            .lock()
            .unwrap()
            .contains(&(ancestor.to_string(), descendant.to_string())))
    }

    fn unpack(&self, reader: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.inner.unpacked.lock().unwrap().push(data);
        Ok(())
    }

    fn pack_stream(&self, plan: String) -> Result<Box<dyn Read + Send>> {
        self.inner.plans.lock().unwrap().push(plan);
        let output = self.inner.pack_output.lock().unwrap().clone();
        Ok(Box::new(std::io::Cursor::new(output)))
    }
}
