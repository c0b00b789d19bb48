//! The object clerk: envelope crypto, content addressing, header binding.
//!
//! Every object in the bucket is named `<device>/<infix>#<hash>` where
//! `hash` is the SHA-256 of the ciphertext. The plaintext begins with a
//! length-prefixed JSON header repeating `(device, infix)`, so a bucket
//! operator cannot silently rename or replay objects across devices: the
//! path is checked against the ciphertext hash before decryption and
//! against the envelope header after.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use futures::StreamExt;
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use tokio::io::AsyncWriteExt;

use crate::broker::{BrokerClient, BrokerError};
use crate::config::{ClerkConfig, ConfigError};

/// Envelope format version. Bump only with a migration story.
pub const ENVELOPE_VERSION: u32 = 1;

const COPY_BUF: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClerkError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("hash {computed:?} did not match downloaded object {path:?}")]
    HashMismatch { computed: String, path: String },

    #[error("received data contained version={found} instead of version={ENVELOPE_VERSION}")]
    EnvelopeVersion { found: u32 },

    #[error("received data contained device={found:?} instead of device={expected:?}")]
    EnvelopeDevice { found: String, expected: String },

    #[error("received data contained infix={found:?} instead of infix={expected:?}")]
    EnvelopeInfix { found: String, expected: String },

    #[error("encryption error: {0}")]
    Encrypt(#[from] age::EncryptError),

    #[error("decryption error: {0}")]
    Decrypt(#[from] age::DecryptError),

    #[error("envelope header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("IsTruncated set but no NextContinuationToken")]
    MissingContinuationToken,

    #[error("continuation token did not advance")]
    StalledContinuationToken,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Split a bucket path into `(device, infix, hash)`.
///
/// `/` is the first separator and `#` the last, so infixes may themselves
/// contain either character without ambiguity.
pub fn split_path(path: &str) -> Result<(&str, &str, &str), ClerkError> {
    let s1 = path.find('/');
    let s2 = path.rfind('#');
    let (s1, s2) = match (s1, s2) {
        (Some(s1), Some(s2)) if s2 > s1 => (s1, s2),
        _ => return Err(ClerkError::InvalidPath(path.to_string())),
    };
    let (device, infix, hash) = (&path[..s1], &path[s1 + 1..s2], &path[s2 + 1..]);
    if device.is_empty() || infix.is_empty() || hash.is_empty() {
        return Err(ClerkError::InvalidPath(path.to_string()));
    }
    Ok((device, infix, hash))
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamHeader {
    version: u32,
    device: String,
    infix: String,
}

fn write_header<W: Write>(mut w: W, header: &StreamHeader) -> Result<(), ClerkError> {
    let data = serde_json::to_vec(header)?;
    w.write_all(&(data.len() as u32).to_be_bytes())?;
    w.write_all(&data)?;
    Ok(())
}

fn read_header<R: Read>(mut r: R) -> Result<StreamHeader, ClerkError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let mut data = vec![0u8; u32::from_be_bytes(len) as usize];
    r.read_exact(&mut data)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Streaming plaintext of a downloaded object.
///
/// The backing temp file holds the already-verified ciphertext; dropping
/// the reader deletes it.
pub struct PlaintextReader {
    reader: age::stream::StreamReader<std::fs::File>,
    _ciphertext: tempfile::NamedTempFile,
}

impl Read for PlaintextReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl std::fmt::Debug for PlaintextReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextReader").finish_non_exhaustive()
    }
}

/// The cryptographic client wrapping all bucket traffic.
///
/// Immutable after creation; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Clerk {
    config: Arc<ClerkConfig>,
    broker: BrokerClient,
}

impl Clerk {
    /// Load the configuration file at `path` and build a clerk from it.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        Ok(Self::new(ClerkConfig::load(path)?))
    }

    /// Build a clerk from an already-validated configuration.
    pub fn new(config: ClerkConfig) -> Self {
        let config = Arc::new(config);
        let broker = BrokerClient::new(config.clone());
        Self { config, broker }
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    /// Keyed filename MAC: lower-hex HMAC-SHA3-256 of `key` under the
    /// shared secret. Used to derive deterministic, unlinkable infixes.
    pub fn hmac(&self, key: &str) -> String {
        let mut mac = Hmac::<Sha3_256>::new_from_slice(self.config.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// List every object path in the bucket, following pagination.
    pub async fn list_objects(&self) -> Result<Vec<String>, ClerkError> {
        let mut paths = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.broker.list_page(token.as_deref()).await?;
            paths.extend(page.keys);
            if !page.is_truncated {
                return Ok(paths);
            }
            let next = page
                .next_token
                .ok_or(ClerkError::MissingContinuationToken)?;
            if token.as_deref() == Some(next.as_str()) {
                return Err(ClerkError::StalledContinuationToken);
            }
            token = Some(next);
        }
    }

    /// Encrypt `source` under the shared passphrase and upload it as
    /// `<device>/<infix>#<hash>`, returning the bucket path the broker
    /// composed.
    ///
    /// The ciphertext is staged in a temp file: content addressing needs
    /// the complete ciphertext hash before the upload can begin.
    pub async fn put_encrypt<R>(&self, infix: &str, source: R) -> Result<String, ClerkError>
    where
        R: Read + Send + 'static,
    {
        let secret = SecretString::from(self.config.secret_key.clone());
        let work_factor = self.config.work_factor;
        let header = StreamHeader {
            version: ENVELOPE_VERSION,
            device: self.config.device_name.clone(),
            infix: infix.to_string(),
        };
        let (ciphertext, sha256_hex, length) =
            tokio::task::spawn_blocking(move || encrypt_to_temp(source, secret, work_factor, header))
                .await??;
        let created = self
            .broker
            .put_object(infix, &sha256_hex, length, ciphertext.reopen()?)
            .await?;
        Ok(created)
    }

    /// Convenience wrapper over [`Clerk::put_encrypt`] for in-memory data.
    pub async fn put_encrypt_bytes(&self, infix: &str, data: Vec<u8>) -> Result<String, ClerkError> {
        self.put_encrypt(infix, std::io::Cursor::new(data)).await
    }

    /// Download, verify, and decrypt one object, returning a streaming
    /// plaintext reader.
    ///
    /// The ciphertext hash is compared against the path before any
    /// decryption happens, so tampering is caught before plaintext is
    /// exposed; decryption itself is streamed so large payloads never live
    /// fully in memory.
    pub async fn get_decrypt(&self, path: &str) -> Result<PlaintextReader, ClerkError> {
        let (device, infix, hash) = split_path(path)?;
        let (device, infix, hash) = (device.to_string(), infix.to_string(), hash.to_string());

        let ciphertext = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(ciphertext.reopen()?);
        let mut hasher = Sha256::new();
        let mut stream = self.broker.get_stream(path).await?.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(BrokerError::from)?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let computed = hex::encode(hasher.finalize());
        if computed != hash {
            return Err(ClerkError::HashMismatch {
                computed,
                path: path.to_string(),
            });
        }

        let secret = SecretString::from(self.config.secret_key.clone());
        tokio::task::spawn_blocking(move || open_decrypt(ciphertext, secret, device, infix)).await?
    }

    /// Download and decrypt one object fully into memory.
    pub async fn get_decrypt_bytes(&self, path: &str) -> Result<Vec<u8>, ClerkError> {
        let mut reader = self.get_decrypt(path).await?;
        Ok(tokio::task::spawn_blocking(move || {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map(|_| data)
        })
        .await??)
    }
}

/// Blocking half of the upload: stream `source` through the age encryptor
/// into a temp file, then hash the ciphertext.
fn encrypt_to_temp<R: Read>(
    mut source: R,
    secret: SecretString,
    work_factor: u8,
    header: StreamHeader,
) -> Result<(tempfile::NamedTempFile, String, u64), ClerkError> {
    let mut recipient = age::scrypt::Recipient::new(secret);
    // 0 means the library default; anything else was range-checked at load
    if work_factor != 0 {
        recipient.set_work_factor(work_factor);
    }
    let mut temp = tempfile::NamedTempFile::new()?;
    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))?;
    let mut writer = encryptor.wrap_output(temp.as_file_mut())?;
    write_header(&mut writer, &header)?;
    std::io::copy(&mut source, &mut writer)?;
    writer.finish()?;

    let file = temp.as_file_mut();
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut length = 0u64;
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    Ok((temp, hex::encode(hasher.finalize()), length))
}

/// Blocking half of the download: open the verified ciphertext, decrypt,
/// and check the envelope header against the path components.
fn open_decrypt(
    ciphertext: tempfile::NamedTempFile,
    secret: SecretString,
    device: String,
    infix: String,
) -> Result<PlaintextReader, ClerkError> {
    let decryptor = age::Decryptor::new(ciphertext.reopen()?)?;
    let identity = age::scrypt::Identity::new(secret);
    let mut reader = decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?;
    let header = read_header(&mut reader)?;
    if header.version != ENVELOPE_VERSION {
        return Err(ClerkError::EnvelopeVersion {
            found: header.version,
        });
    }
    if header.device != device {
        return Err(ClerkError::EnvelopeDevice {
            found: header.device,
            expected: device,
        });
    }
    if header.infix != infix {
        return Err(ClerkError::EnvelopeInfix {
            found: header.infix,
            expected: infix,
        });
    }
    Ok(PlaintextReader {
        reader,
        _ciphertext: ciphertext,
    })
}
