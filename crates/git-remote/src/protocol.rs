//! The git remote-helper line protocol.
//!
//! git talks to us over stdin/stdout: one command per line, batches of
//! `fetch`/`push` lines terminated by a blank line. The driver is strictly
//! sequential; a blank top-level line or EOF ends the session cleanly.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::refs::{validate_commit, validate_ref_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRef {
    /// 40-hex commit id, or `@<ref>` for a symbolic ref.
    pub commit: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRef {
    pub commit: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRef {
    pub force: bool,
    pub source: String,
    pub dest: String,
}

/// Per-ref push outcome: `None` is ok, `Some(msg)` is a per-ref error.
pub type PushStatus = Option<String>;

#[async_trait]
pub trait RemoteHelper: Send {
    async fn list(&mut self) -> Result<Vec<ListRef>>;
    async fn list_for_push(&mut self) -> Result<Vec<ListRef>>;
    async fn fetch(&mut self, refs: &[FetchRef]) -> Result<()>;
    async fn push(&mut self, refs: &[PushRef]) -> Result<Vec<PushStatus>>;
}

fn parse_fetch_ref(line: &str) -> Result<FetchRef> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 || parts[0] != "fetch" {
        bail!("invalid fetch line: {line:?}");
    }
    Ok(FetchRef {
        commit: parts[1].to_string(),
        name: parts[2].to_string(),
    })
}

fn parse_push_ref(line: &str) -> Result<PushRef> {
    let Some(mut spec) = line.strip_prefix("push ") else {
        bail!("invalid push line: {line:?}");
    };
    let force = spec.starts_with('+');
    if force {
        spec = &spec[1..];
    }
    let Some((source, dest)) = spec.split_once(':') else {
        bail!("invalid push line: {line:?}");
    };
    if source.is_empty() || dest.is_empty() {
        bail!("invalid push line: {line:?}");
    }
    Ok(PushRef {
        force,
        source: source.to_string(),
        dest: dest.to_string(),
    })
}

async fn print_list<W>(writer: &mut W, refs: &[ListRef]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for r in refs {
        validate_commit(&r.commit)?;
        validate_ref_name(&r.name)?;
        writer
            .write_all(format!("{} {}\n", r.commit, r.name).as_bytes())
            .await?;
    }
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_line<R>(lines: &mut tokio::io::Lines<R>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    lines
        .next_line()
        .await?
        .context("unexpected EOF in command batch")
}

/// Run the command loop until EOF or a blank top-level line.
pub async fn mainloop<R, W, H>(reader: R, mut writer: W, helper: &mut H) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    H: RemoteHelper,
{
    let mut lines = reader.lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        if line.is_empty() {
            // end of command stream
            return Ok(());
        } else if line == "capabilities" {
            writer.write_all(b"fetch\npush\n\n").await?;
            writer.flush().await?;
        } else if line == "list" {
            let list = helper.list().await?;
            print_list(&mut writer, &list).await?;
        } else if line == "list for-push" {
            let list = helper.list_for_push().await?;
            print_list(&mut writer, &list).await?;
        } else if line.starts_with("fetch ") {
            let mut refs = Vec::new();
            let mut line = line;
            while !line.is_empty() {
                refs.push(parse_fetch_ref(&line)?);
                line = read_line(&mut lines).await?;
            }
            helper.fetch(&refs).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        } else if line.starts_with("push ") {
            let mut refs = Vec::new();
            let mut line = line;
            while !line.is_empty() {
                refs.push(parse_push_ref(&line)?);
                line = read_line(&mut lines).await?;
            }
            let statuses = helper.push(&refs).await?;
            if statuses.len() != refs.len() {
                bail!("remote helper returned wrong number of statuses for push");
            }
            for (r, status) in refs.iter().zip(&statuses) {
                let reply = match status {
                    None => format!("ok {}\n", r.dest),
                    Some(msg) => format!("error {} {:?}\n", r.dest, msg),
                };
                writer.write_all(reply.as_bytes()).await?;
            }
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        } else {
            bail!("unrecognized input line {line:?}");
        }
    }
}
