//! The git-annex external-special-remote protocol.
//!
//! git-annex drives us over stdin/stdout. In the default synchronous mode
//! there is a single command stream; once `ASYNC` is negotiated via
//! `EXTENSIONS`, every line carries a `J <job-id>` prefix and the reader
//! fans lines out to one worker per job. Each worker owns a single-slot
//! input channel; a second undelivered line for the same job is a protocol
//! error. All output is serialized through one writer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Prefix on every failure message and the trailing ERROR line.
pub const ERROR_PREFIX: &str = "nightmarket";

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub name: String,
    pub description: String,
}

/// The operations a special remote implements; the driver translates
/// protocol lines into calls and results back into reply lines.
#[async_trait]
pub trait SpecialRemote: Send + Sync + 'static {
    /// Whether to opt into ASYNC when git-annex offers it.
    fn negotiate_async(&self) -> bool;
    async fn list_configs(&self) -> Result<Vec<RemoteConfig>>;
    async fn init_remote(&self, r: &mut Responder) -> Result<()>;
    async fn prepare(&self, r: &mut Responder) -> Result<()>;
    async fn transfer_store(&self, r: &mut Responder, key: &str, path: &str) -> Result<()>;
    async fn transfer_retrieve(&self, r: &mut Responder, key: &str, path: &str) -> Result<()>;
    async fn check_present(&self, r: &mut Responder, key: &str) -> Result<bool>;
    async fn remove(&self, r: &mut Responder, key: &str) -> Result<()>;
}

/// Serialized line writer shared by every job.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl LineWriter {
    fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if line.contains('\n') {
            bail!("api error: refusing to write line containing interlinear newline: {line:?}");
        }
        tracing::debug!(target: "wire", "to annex: {line:?}");
        let mut writer = self.inner.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// One job's view of the protocol: replies carry the job prefix, and
/// host queries (GETCONFIG and friends) read their answers from the
/// job's own input channel.
pub struct Responder {
    job: u32,
    writer: LineWriter,
    receiver: mpsc::Receiver<String>,
}

impl Responder {
    /// Build a main-job responder outside the protocol loop, for driving
    /// a [`SpecialRemote`] directly (tests, tooling). Returns the sender
    /// feeding its input channel alongside it.
    pub fn detached(
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> (Responder, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Responder {
                job: 0,
                writer: LineWriter::new(writer),
                receiver: rx,
            },
            tx,
        )
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if self.job > 0 {
            self.writer.write_line(&format!("J {} {line}", self.job)).await
        } else {
            self.writer.write_line(line).await
        }
    }

    async fn read_line(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    async fn read_value(&mut self) -> Result<String> {
        let line = self
            .read_line()
            .await
            .context("unexpected EOF while expecting VALUE from git-annex")?;
        let Some(value) = line.strip_prefix("VALUE ") else {
            bail!("invalid response when expecting VALUE from git-annex: {line:?}");
        };
        Ok(value.to_string())
    }

    pub async fn get_config(&mut self, setting: &str) -> Result<String> {
        if setting.is_empty() || setting.contains(' ') {
            bail!("api error: refusing to transmit invalid config name {setting:?}");
        }
        self.write_line(&format!("GETCONFIG {setting}")).await?;
        self.read_value().await
    }

    pub async fn get_git_dir(&mut self) -> Result<String> {
        self.write_line("GETGITDIR").await?;
        self.read_value().await
    }

    pub async fn progress(&self, bytes: u64) -> Result<()> {
        self.write_line(&format!("PROGRESS {bytes}")).await
    }

    pub async fn debug(&self, message: &str) -> Result<()> {
        self.write_line(&format!("DEBUG {message}")).await
    }
}

async fn run_command<H: SpecialRemote>(
    remote: &H,
    resp: &mut Responder,
    line: &str,
) -> Result<()> {
    let arguments: Vec<&str> = line.split(' ').collect();
    match arguments[0] {
        "LISTCONFIGS" => {
            if arguments.len() != 1 {
                bail!("invalid command: LISTCONFIGS with arguments");
            }
            let configs = remote.list_configs().await?;
            for config in configs {
                if config.name.is_empty() || config.name.contains(' ') {
                    bail!(
                        "api error: refusing to return invalid config name {:?}",
                        config.name
                    );
                }
                resp.write_line(&format!("CONFIG {} {}", config.name, config.description))
                    .await?;
            }
            resp.write_line("CONFIGEND").await?;
        }
        "INITREMOTE" => {
            if arguments.len() != 1 {
                bail!("invalid command: INITREMOTE with arguments");
            }
            let reply = match remote.init_remote(resp).await {
                Ok(()) => "INITREMOTE-SUCCESS".to_string(),
                Err(e) => format!("INITREMOTE-FAILURE {ERROR_PREFIX}: {e:#}"),
            };
            resp.write_line(&reply).await?;
        }
        "PREPARE" => {
            if arguments.len() != 1 {
                bail!("invalid command: PREPARE with arguments");
            }
            let reply = match remote.prepare(resp).await {
                Ok(()) => "PREPARE-SUCCESS".to_string(),
                Err(e) => format!("PREPARE-FAILURE {ERROR_PREFIX}: {e:#}"),
            };
            resp.write_line(&reply).await?;
        }
        "TRANSFER" => {
            if arguments.len() < 4 {
                bail!("invalid transfer command: {line:?}");
            }
            let direction = arguments[1];
            let key = arguments[2];
            let path = arguments[3..].join(" ");
            let result = match direction {
                "STORE" => remote.transfer_store(resp, key, &path).await,
                "RETRIEVE" => remote.transfer_retrieve(resp, key, &path).await,
                _ => bail!("unrecognized transfer command: {line:?}"),
            };
            let reply = match result {
                Ok(()) => format!("TRANSFER-SUCCESS {direction} {key}"),
                Err(e) => format!("TRANSFER-FAILURE {direction} {key} {ERROR_PREFIX}: {e:#}"),
            };
            resp.write_line(&reply).await?;
        }
        "CHECKPRESENT" => {
            if arguments.len() != 2 {
                bail!("invalid checkpresent command: {line:?}");
            }
            let key = arguments[1];
            let reply = match remote.check_present(resp, key).await {
                Ok(true) => format!("CHECKPRESENT-SUCCESS {key}"),
                Ok(false) => format!("CHECKPRESENT-FAILURE {key}"),
                Err(e) => format!("CHECKPRESENT-UNKNOWN {key} {ERROR_PREFIX}: {e:#}"),
            };
            resp.write_line(&reply).await?;
        }
        "REMOVE" => {
            if arguments.len() != 2 {
                bail!("invalid remove command: {line:?}");
            }
            let key = arguments[1];
            let reply = match remote.remove(resp, key).await {
                Ok(()) => format!("REMOVE-SUCCESS {key}"),
                Err(e) => format!("REMOVE-FAILURE {key} {ERROR_PREFIX}: {e:#}"),
            };
            resp.write_line(&reply).await?;
        }
        _ => {
            resp.write_line("UNSUPPORTED-REQUEST").await?;
        }
    }
    Ok(())
}

/// Split a raw input line into `(command, job)`; job 0 is the unnumbered
/// main job of synchronous mode.
fn parse_job_id(line: &str, is_async: bool) -> Result<(String, u32)> {
    if !is_async {
        if line.starts_with("J ") {
            bail!("not in ASYNC mode; should not have received J prefix in {line:?}");
        }
        return Ok((line.to_string(), 0));
    }
    let mut parts = line.splitn(3, ' ');
    if parts.next() != Some("J") {
        bail!("in ASYNC mode; should have received J prefix in {line:?}");
    }
    let (Some(job), Some(rest)) = (parts.next(), parts.next()) else {
        bail!("in ASYNC mode; needed arguments after prefix in {line:?}");
    };
    let job: u32 = job
        .parse()
        .with_context(|| format!("invalid ASYNC job number in {line:?}"))?;
    if job < 1 || job >= 1 << 31 {
        bail!("invalid ASYNC job number: {job}");
    }
    Ok((rest.to_string(), job))
}

/// Run the protocol until EOF or a fatal error. On failure a trailing
/// `ERROR` line is emitted so the host sees the diagnosis too.
pub async fn mainloop<H, R, W>(remote: Arc<H>, reader: R, writer: W) -> Result<()>
where
    H: SpecialRemote,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = LineWriter::new(writer);
    let result = run_loop(remote, reader, writer.clone()).await;
    if let Err(e) = &result {
        let _ = writer
            .write_line(&format!("ERROR {ERROR_PREFIX}: {e:#}"))
            .await;
    }
    result
}

async fn run_loop<H, R>(remote: Arc<H>, reader: R, writer: LineWriter) -> Result<()>
where
    H: SpecialRemote,
    R: AsyncBufRead + Unpin,
{
    writer.write_line("VERSION 1").await?;

    let mut lines = reader.lines();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<anyhow::Error>();
    let mut senders: HashMap<u32, mpsc::Sender<String>> = HashMap::new();
    let mut workers = JoinSet::new();
    let mut is_async = false;
    let mut errors: Vec<anyhow::Error> = Vec::new();

    loop {
        tokio::select! {
            Some(e) = err_rx.recv() => {
                errors.push(e);
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        errors.push(e.into());
                        break;
                    }
                };
                tracing::debug!(target: "wire", "to helper: {line:?}");
                if line == "EXTENSIONS" || line.starts_with("EXTENSIONS ") {
                    let mut reply = String::from("EXTENSIONS");
                    if line.split(' ').skip(1).any(|e| e == "ASYNC") && remote.negotiate_async() {
                        is_async = true;
                        reply.push_str(" ASYNC");
                    }
                    if let Err(e) = writer.write_line(&reply).await {
                        errors.push(e);
                        break;
                    }
                    continue;
                }
                let (args, job) = match parse_job_id(&line, is_async) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        errors.push(e);
                        break;
                    }
                };
                let sender = senders.entry(job).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(1);
                    let mut responder = Responder {
                        job,
                        writer: writer.clone(),
                        receiver: rx,
                    };
                    let remote = remote.clone();
                    let err_tx = err_tx.clone();
                    workers.spawn(async move {
                        while let Some(args) = responder.read_line().await {
                            if let Err(e) =
                                run_command(remote.as_ref(), &mut responder, &args).await
                            {
                                let _ = err_tx.send(e);
                                break;
                            }
                        }
                    });
                    tx
                });
                if sender.try_send(args).is_err() {
                    errors.push(anyhow!(
                        "received nested response data for job worker {job} when none was expected"
                    ));
                    break;
                }
            }
        }
    }

    // closing every input channel tells the workers to wind down; collect
    // whatever they report until all of them have exited
    senders.clear();
    drop(err_tx);
    while workers.join_next().await.is_some() {}
    while let Ok(e) = err_rx.try_recv() {
        errors.push(e);
    }

    let mut errors = errors.into_iter();
    match errors.next() {
        None => Ok(()),
        Some(first) => {
            let mut message = format!("{first:#}");
            for e in errors {
                message.push_str(&format!("; {e:#}"));
            }
            Err(anyhow!(message))
        }
    }
}
