//! One-directional named-pipe transport.
//!
//! Every payload travels as one JSON-encoded [`PipeFrame`] per open/write/close
//! cycle. A writer may reopen while the reader still holds the previous open,
//! so one read can carry several frames back to back; the receiver splits
//! them and hands them out one per `receive`.
//!
//! Opening a FIFO blocks until the peer attaches, so all opens, reads and
//! writes run on tokio's blocking pool and are awaited by the caller. A writer
//! whose peer never attaches waits forever; there is no timeout.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task;

use crate::relay_get_unix_timestamp_ms;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("pipe {path} {op} failed: {source}")]
    Io {
        path: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("pipe {0} exists but is not a fifo")]
    NotAFifo(String),
    #[error("pipe {path} {op} worker failed: {message}")]
    Worker {
        path: String,
        op: &'static str,
        message: String,
    },
    #[error("pipe {path} payload encode failed: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("pipe {path} payload decode failed: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("pipe {0} closed by the writer without a frame")]
    Empty(String),
    #[error("named pipes are not supported on this platform")]
    Unsupported,
}

pub type PipeResult<T> = std::result::Result<T, PipeError>;

impl PipeError {
    /// Transport failures are retried after a fixed sleep. Encode/decode
    /// failures drop the message in flight.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            PipeError::Encode { .. } | PipeError::Decode { .. } | PipeError::Empty(_)
        )
    }

    fn io(path: &Path, op: &'static str, source: std::io::Error) -> Self {
        PipeError::Io {
            path: path.display().to_string(),
            op,
            source,
        }
    }

    fn worker(path: &Path, op: &'static str, err: task::JoinError) -> Self {
        PipeError::Worker {
            path: path.display().to_string(),
            op,
            message: err.to_string(),
        }
    }
}

/// Wire envelope. `seq` starts at 1 per sender and direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeFrame<T> {
    pub seq: u64,
    pub sent_at_ms: u64,
    pub payload: T,
}

/// Creates the FIFO at `path` if it is absent. Idempotent.
pub fn ensure_pipe(path: &Path) -> PipeResult<()> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if is_fifo(&meta) {
                Ok(())
            } else {
                Err(PipeError::NotAFifo(path.display().to_string()))
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => make_fifo(path),
        Err(err) => Err(PipeError::io(path, "stat", err)),
    }
}

/// Removes whatever is at `path` and creates a fresh FIFO.
pub fn recreate_pipe(path: &Path) -> PipeResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale pipe {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(PipeError::io(path, "remove", err)),
    }
    make_fifo(path)
}

#[cfg(unix)]
fn is_fifo(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> PipeResult<()> {
    use nix::errno::Errno;
    use nix::sys::stat::Mode;

    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => {
            info!("created pipe {}", path.display());
            Ok(())
        }
        // the peer created it first
        Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(PipeError::io(path, "mkfifo", std::io::Error::from(errno))),
    }
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> PipeResult<()> {
    Err(PipeError::Unsupported)
}

fn write_blocking(path: &Path, bytes: &[u8]) -> PipeResult<()> {
    ensure_pipe(path)?;
    let mut pipe = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| PipeError::io(path, "open for write", err))?;
    pipe.write_all(bytes)
        .map_err(|err| PipeError::io(path, "write", err))?;
    pipe.flush().map_err(|err| PipeError::io(path, "flush", err))
}

fn read_blocking(path: &Path) -> PipeResult<Vec<u8>> {
    let mut pipe = File::open(path).map_err(|err| PipeError::io(path, "open for read", err))?;
    let mut bytes = Vec::new();
    pipe.read_to_end(&mut bytes)
        .map_err(|err| PipeError::io(path, "read", err))?;
    Ok(bytes)
}

/// Splits one read into the frames it carries. A torn tail after complete
/// frames is logged and cut off; a read with no complete frame is an error.
fn decode_frames<T: DeserializeOwned>(
    path: &Path,
    bytes: &[u8],
) -> PipeResult<Vec<PipeFrame<T>>> {
    let mut frames = Vec::new();
    for decoded in serde_json::Deserializer::from_slice(bytes).into_iter::<PipeFrame<T>>() {
        match decoded {
            Ok(frame) => frames.push(frame),
            Err(source) if frames.is_empty() => {
                return Err(PipeError::Decode {
                    path: path.display().to_string(),
                    source,
                })
            }
            Err(err) => {
                warn!(
                    "pipe {} dropped a torn frame after {} good one(s): {}",
                    path.display(),
                    frames.len(),
                    err
                );
                break;
            }
        }
    }
    if frames.is_empty() {
        return Err(PipeError::Empty(path.display().to_string()));
    }
    Ok(frames)
}

/// Writing end of one direction.
///
/// The internal lock is held for the whole send, so callers in one process
/// never interleave writes on the same pipe.
pub struct PipeSender<T> {
    path: PathBuf,
    retry_interval: Duration,
    next_seq: Mutex<u64>,
    _payload: PhantomData<fn(T)>,
}

impl<T: Serialize> PipeSender<T> {
    pub fn new(path: impl Into<PathBuf>, retry_interval: Duration) -> Self {
        Self {
            path: path.into(),
            retry_interval,
            next_seq: Mutex::new(1),
            _payload: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, seq: u64, payload: T) -> PipeResult<Arc<Vec<u8>>> {
        let frame = PipeFrame {
            seq,
            sent_at_ms: relay_get_unix_timestamp_ms(),
            payload,
        };
        serde_json::to_vec(&frame)
            .map(Arc::new)
            .map_err(|source| PipeError::Encode {
                path: self.path.display().to_string(),
                source,
            })
    }

    async fn write_once(&self, bytes: Arc<Vec<u8>>) -> PipeResult<()> {
        let path = self.path.clone();
        task::spawn_blocking(move || write_blocking(&path, &bytes))
            .await
            .map_err(|err| PipeError::worker(&self.path, "write", err))?
    }

    /// Single attempt. Consumes the payload; returns the frame sequence number.
    pub async fn send(&self, payload: T) -> PipeResult<u64> {
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        let bytes = self.encode(seq, payload)?;
        self.write_once(bytes).await?;
        *next_seq += 1;
        Ok(seq)
    }

    /// Retries transport failures forever with a fixed sleep. The payload is
    /// encoded once, so only an encode failure is returned.
    pub async fn send_until_delivered(&self, payload: T) -> PipeResult<u64> {
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        let bytes = self.encode(seq, payload)?;
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.write_once(bytes.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        "send frame {} to pipe {} failed (attempt {}), retry in {:?}: {}",
                        seq,
                        self.path.display(),
                        attempt,
                        self.retry_interval,
                        err
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
        *next_seq += 1;
        Ok(seq)
    }
}

/// Reading end of one direction. The payload shape is fixed per pipe.
pub struct PipeReceiver<T> {
    path: PathBuf,
    last_seq: Option<u64>,
    queued: VecDeque<PipeFrame<T>>,
}

impl<T: DeserializeOwned + Send + 'static> PipeReceiver<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seq: None,
            queued: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Returns the next queued frame, or blocks (on the worker pool) until a
    /// writer attaches and closes and returns the first frame of that read.
    /// Never creates the path.
    pub async fn receive(&mut self) -> PipeResult<T> {
        if let Some(frame) = self.queued.pop_front() {
            return Ok(self.deliver(frame));
        }

        let path = self.path.clone();
        let frames = task::spawn_blocking(move || -> PipeResult<Vec<PipeFrame<T>>> {
            let bytes = read_blocking(&path)?;
            decode_frames(&path, &bytes)
        })
        .await
        .map_err(|err| PipeError::worker(&self.path, "read", err))??;

        let mut frames = VecDeque::from(frames);
        let first = frames
            .pop_front()
            .ok_or_else(|| PipeError::Empty(self.path.display().to_string()))?;
        if !frames.is_empty() {
            debug!(
                "pipe {} read carried {} extra frame(s)",
                self.path.display(),
                frames.len()
            );
        }
        self.queued = frames;
        Ok(self.deliver(first))
    }

    fn deliver(&mut self, frame: PipeFrame<T>) -> T {
        self.track_seq(frame.seq);
        debug!(
            "pipe {} frame {} in flight for {}ms",
            self.path.display(),
            frame.seq,
            relay_get_unix_timestamp_ms().saturating_sub(frame.sent_at_ms)
        );
        frame.payload
    }

    fn track_seq(&mut self, seq: u64) {
        match self.last_seq {
            Some(last) if seq == last + 1 => {}
            Some(last) if seq > last + 1 => {
                warn!(
                    "pipe {} lost {} frame(s) between seq {} and {}",
                    self.path.display(),
                    seq - last - 1,
                    last,
                    seq
                );
            }
            Some(last) => {
                info!(
                    "pipe {} sequence restarted at {} after {}, peer restarted",
                    self.path.display(),
                    seq,
                    last
                );
            }
            None => debug!("pipe {} first frame seq {}", self.path.display(), seq),
        }
        self.last_seq = Some(seq);
    }
}
