//! Size-bounded log files.
//!
//! A [`RotatingLog`] appends to a file until the next write would take it past its maximum size.
//! The full file is then renamed with an `.old` extension and writing continues in a fresh file,
//! so at most two generations are ever kept on disk.
//!
//! All file I/O happens on a background task. Writers only push bytes onto a channel, which makes
//! the log usable from synchronous contexts such as a `tracing` writer.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    fs::{remove_file, rename, File, OpenOptions},
    io::AsyncWriteExt,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default maximum size of a log file before it is rotated.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A log file that rotates itself once it reaches a maximum size.
///
/// # Example
///
/// ```no_run
/// use nexusutils::log::RotatingLog;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let log = RotatingLog::new("instance.log").await?;
///     log.append(b"hello\n");
///     log.flush().await?;
///     Ok(())
/// }
/// ```
pub struct RotatingLog {
    path: PathBuf,
    max_size: u64,
    current_size: Arc<AtomicU64>,
    tx: UnboundedSender<Command>,
    _background_task: JoinHandle<()>,
}

/// A sync writer that forwards everything written to it to a [`RotatingLog`].
#[derive(Clone)]
pub struct SyncChannelWriter {
    tx: UnboundedSender<Command>,
}

enum Command {
    Data(Vec<u8>),
    Flush(oneshot::Sender<io::Result<()>>),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Opens a rotating log with [`DEFAULT_LOG_MAX_SIZE`].
    pub async fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_max_size(path, DEFAULT_LOG_MAX_SIZE).await
    }

    /// Opens a rotating log, creating the file (and its parent directory) if needed.
    pub async fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let metadata = file.metadata().await?;
        let current_size = Arc::new(AtomicU64::new(metadata.len()));

        let (tx, rx) = mpsc::unbounded_channel();
        let background_task = tokio::spawn(handle_commands(
            rx,
            file,
            path.clone(),
            max_size,
            Arc::clone(&current_size),
        ));

        Ok(Self {
            path,
            max_size,
            current_size,
            tx,
            _background_task: background_task,
        })
    }

    /// Queues bytes to be appended to the log.
    pub fn append(&self, data: &[u8]) {
        let _ = self.tx.send(Command::Data(data.to_vec()));
    }

    /// Waits until every previously queued write has reached the file.
    pub async fn flush(&self) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log writer has stopped"))?;

        done_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log writer has stopped"))?
    }

    /// Gets a sync writer that implements [`std::io::Write`].
    pub fn get_sync_writer(&self) -> SyncChannelWriter {
        SyncChannelWriter {
            tx: self.tx.clone(),
        }
    }

    /// The path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The size in bytes at which the log rotates.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The number of bytes currently in the active log file.
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Write for SyncChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Command::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log writer has stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn handle_commands(
    mut rx: UnboundedReceiver<Command>,
    mut file: File,
    path: PathBuf,
    max_size: u64,
    current_size: Arc<AtomicU64>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Data(data) => {
                let size = current_size.load(Ordering::Relaxed);
                if size > 0 && size + data.len() as u64 > max_size {
                    match rotate(&mut file, &path).await {
                        Ok(new_file) => {
                            file = new_file;
                            current_size.store(0, Ordering::Relaxed);
                        }
                        Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to rotate log"),
                    }
                }

                if let Err(e) = file.write_all(&data).await {
                    tracing::error!(path = %path.display(), error = %e, "failed to write log");
                    continue;
                }
                current_size.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Command::Flush(done) => {
                let _ = done.send(file.flush().await);
            }
        }
    }
}

async fn rotate(file: &mut File, path: &Path) -> io::Result<File> {
    file.flush().await?;

    let old_path = path.with_extension("old");
    let _ = remove_file(&old_path).await;
    rename(path, &old_path).await?;

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
