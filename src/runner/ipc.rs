//! Named-pipe IPC with the child interpreter
//!
//! The child writes a complete HTTP/1.1 response (status line, headers,
//! body) into a FIFO created per invocation.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::RngExt;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::sys;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Pause between attempts to release a reader that has not reached `open()` yet.
const RELEASE_INTERVAL: Duration = Duration::from_millis(10);
/// How long a dropped [`ReaderOpen`] keeps releasing its reader.
const ABANDON_LIMIT: Duration = Duration::from_secs(30);

/// A FIFO in the temp dir, removed on drop.
#[derive(Debug)]
pub struct Fifo {
    path: PathBuf,
}

impl Fifo {
    /// Create `{tmp}/gram-fifo-{8 random chars}`
    pub fn create() -> io::Result<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    /// Create a FIFO in `dir`
    pub fn create_in(dir: &Path) -> io::Result<Self> {
        let bytes: [u8; 8] = rand::rng().random();
        let suffix: String = bytes
            .iter()
            .map(|b| char::from(SUFFIX_ALPHABET[usize::from(*b) % SUFFIX_ALPHABET.len()]))
            .collect();
        let path = dir.join(format!("gram-fifo-{suffix}"));
        sys::mkfifo(&path, 0o600)?;
        Ok(Self { path })
    }

    /// Path handed to the child
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start opening the read end. The open blocks until a writer appears,
    /// so it runs on the blocking pool.
    pub fn open_reader(self: &Arc<Self>) -> ReaderOpen {
        let path = self.path.clone();
        ReaderOpen {
            fifo: Arc::clone(self),
            task: Some(tokio::task::spawn_blocking(move || std::fs::File::open(path))),
        }
    }

    /// Release a reader blocked in `open()` by briefly opening the write
    /// end. Returns `false` when no reader has reached `open()` yet.
    pub fn unblock_reader(&self) -> bool {
        let opened = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);
        match opened {
            Ok(_) => true,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => false,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to release pipe reader");
                false
            }
        }
    }
}

/// A pending open of a FIFO's read end.
///
/// Dropping it before the open returns keeps releasing the blocked thread
/// in the background, so the thread and the FIFO are never stranded.
#[derive(Debug)]
pub struct ReaderOpen {
    fifo: Arc<Fifo>,
    task: Option<JoinHandle<io::Result<std::fs::File>>>,
}

impl ReaderOpen {
    /// Release the reader until its open returns or `until` passes.
    ///
    /// Used once no writer can appear any more: the blocking thread may not
    /// have entered `open()` when the first release is attempted.
    pub async fn release(&mut self, until: Instant) -> Option<io::Result<File>> {
        loop {
            self.fifo.unblock_reader();
            let wait = until
                .saturating_duration_since(Instant::now())
                .min(RELEASE_INTERVAL);
            match tokio::time::timeout(wait, &mut *self).await {
                Ok(opened) => return Some(opened),
                Err(_) if Instant::now() >= until => return None,
                Err(_) => {}
            }
        }
    }
}

impl Future for ReaderOpen {
    type Output = io::Result<File>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(Err(io::Error::other("pipe reader already returned")));
        };
        let joined = std::task::ready!(Pin::new(task).poll(cx));
        self.task = None;
        Poll::Ready(match joined {
            Ok(Ok(file)) => Ok(File::from_std(file)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        })
    }
}

impl Drop for ReaderOpen {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if task.is_finished() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let fifo = Arc::clone(&self.fifo);
        runtime.spawn(async move {
            let give_up = Instant::now() + ABANDON_LIMIT;
            while !task.is_finished() {
                if Instant::now() >= give_up {
                    warn!(path = %fifo.path.display(), "pipe reader still blocked, abandoning it");
                    return;
                }
                fifo.unblock_reader();
                tokio::time::sleep(RELEASE_INTERVAL).await;
            }
            debug!(path = %fifo.path.display(), "released abandoned pipe reader");
        });
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, path = %self.path.display(), "failed to remove pipe");
        }
    }
}

/// Status line and headers of the child's response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code
    pub status: u16,
    /// Headers in the order written
    pub headers: Vec<(String, String)>,
    /// Body bytes read past the header block
    pub body_prefix: Bytes,
}

impl ResponseHead {
    /// First value of a header, case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length, when present
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Read the status line and headers of an HTTP/1.x response.
///
/// # Errors
///
/// `InvalidData` when the head is malformed, larger than 64 KiB, or the
/// stream ends before the blank line.
pub async fn read_response_head<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<ResponseHead> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed before response headers",
            ));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let status = response
                    .code
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing status code"))?;
                let headers = response
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                    .collect();
                let body_prefix = buf.split_off(len).freeze();
                return Ok(ResponseHead {
                    status,
                    headers,
                    body_prefix,
                });
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD_SIZE => {}
            Ok(httparse::Status::Partial) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}
