//! Narrow interface over the host git binary.
//!
//! The helper never inspects repository state itself; everything goes
//! through these five operations. They run with the environment git gave
//! us, so `GIT_DIR` is already set. The trait exists so the merge-ancestor
//! analysis can be exercised against a scripted oracle in tests.

use std::io::Read;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait GitOps: Clone + Send + Sync + 'static {
    /// `rev-parse --verify` a ref into a commit id.
    async fn rev_parse(&self, rev: &str) -> Result<String>;

    /// Object type of `id` (`commit`, `blob`, ...).
    async fn object_type(&self, id: &str) -> Result<String>;

    /// Whether `ancestor` is an ancestor of `descendant`.
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Feed a thin pack into the object database. Blocking; run inside
    /// `spawn_blocking`. Any output on stdout is an anomaly.
    fn unpack(&self, reader: &mut dyn Read) -> Result<()>;

    /// Start `pack-objects` over the given rev plan and return its output
    /// stream. Blocking reader; a non-zero exit surfaces as a read error
    /// once the stream drains.
    fn pack_stream(&self, plan: String) -> Result<Box<dyn Read + Send>>;
}

/// The real git subprocess runner.
#[derive(Debug, Clone, Default)]
pub struct Git;

impl Git {
    pub fn new() -> Self {
        Git
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .stderr(Stdio::inherit())
            .output()
            .await
            .with_context(|| format!("while trying to run git {args:?}"))?;
        if !output.status.success() {
            bail!("git {args:?} failed with {}", output.status);
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}

#[async_trait]
impl GitOps for Git {
    async fn rev_parse(&self, rev: &str) -> Result<String> {
        self.run_capture(&["rev-parse", "--verify", "--end-of-options", rev])
            .await
    }

    async fn object_type(&self, id: &str) -> Result<String> {
        self.run_capture(&["cat-file", "-t", "--", id]).await
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = tokio::process::Command::new("git")
            .args(["merge-base", "--is-ancestor", "--", ancestor, descendant])
            .output()
            .await
            .context("while trying to run git merge-base")?;
        if output.status.success() {
            if !output.stdout.is_empty() {
                bail!(
                    "unexpected output from merge-base: {:?}",
                    String::from_utf8_lossy(&output.stdout)
                );
            }
            return Ok(true);
        }
        // exit code 1 with no output means "no", anything else is a failure
        if output.status.code() == Some(1) && output.stdout.is_empty() && output.stderr.is_empty() {
            return Ok(false);
        }
        bail!(
            "git merge-base failed with {}: {:?}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn unpack(&self, reader: &mut dyn Read) -> Result<()> {
        let mut child = std::process::Command::new("git")
            .args(["unpack-objects", "-q"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("while spawning git unpack-objects")?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        std::io::copy(reader, &mut stdin).context("while feeding git unpack-objects")?;
        drop(stdin);
        let output = child
            .wait_with_output()
            .context("while waiting for git unpack-objects")?;
        if !output.status.success() {
            bail!("git unpack-objects failed with {}", output.status);
        }
        if !output.stdout.is_empty() {
            bail!(
                "unexpected output from unpack-objects: {:?}",
                String::from_utf8_lossy(&output.stdout)
            );
        }
        Ok(())
    }

    fn pack_stream(&self, plan: String) -> Result<Box<dyn Read + Send>> {
        let mut child = std::process::Command::new("git")
            .args(["pack-objects", "--stdout", "--thin", "--revs"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("while spawning git pack-objects")?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        // write the plan from a separate thread so a long exclusion list
        // cannot deadlock against the pack output pipe
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            use std::io::Write;
            stdin.write_all(plan.as_bytes())?;
            Ok(())
        });
        Ok(Box::new(PackStream {
            child,
            stdout,
            writer: Some(writer),
            finished: false,
        }))
    }
}

/// Streaming output of `git pack-objects`; checks the exit status once the
/// stream drains.
struct PackStream {
    child: std::process::Child,
    stdout: std::process::ChildStdout,
    writer: Option<std::thread::JoinHandle<std::io::Result<()>>>,
    finished: bool,
}

impl PackStream {
    fn finish(&mut self) -> std::io::Result<()> {
        self.finished = true;
        if let Some(writer) = self.writer.take() {
            match writer.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(std::io::Error::other("pack plan writer panicked"));
                }
            }
        }
        let status = self.child.wait()?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "git pack-objects failed with {status}"
            )));
        }
        Ok(())
    }
}

impl Read for PackStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for PackStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
