use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::response::ResponseWriter;
use crate::subscription::{Subscriber, Subscription};

/// Append-only storage for one response body. File and buffer stores can be
/// tailed by any number of concurrent readers while the writer is still
/// streaming; the passthrough variant pipes bytes straight into the
/// originating client's writer and has no readers.
pub enum Body {
    File(FileBody),
    Buffer(BufferBody),
    Passthrough(PassthroughBody),
}

pub struct FileBody {
    path: PathBuf,
    file: Mutex<File>,
    subscription: Subscription,
}

pub struct BufferBody {
    buf: Arc<RwLock<Vec<u8>>>,
    subscription: Subscription,
}

pub struct PassthroughBody {
    // Dropped at close so a cached private slot does not pin the client's
    // writer for its whole coalescing window.
    writer: Mutex<Option<Arc<dyn ResponseWriter>>>,
}

impl Body {
    /// Creates a file-backed store under `dir` with a process-unique name.
    pub fn file_in(dir: &Path) -> Result<Body> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create cache dir {}", dir.display()))?;
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let path = dir.join(format!("cellar-{name}"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("create body file {}", path.display()))?;
        Ok(Body::File(FileBody {
            path,
            file: Mutex::new(file),
            subscription: Subscription::new(),
        }))
    }

    pub fn buffer() -> Body {
        Body::Buffer(BufferBody {
            buf: Arc::new(RwLock::new(Vec::new())),
            subscription: Subscription::new(),
        })
    }

    pub fn passthrough(writer: Arc<dyn ResponseWriter>) -> Body {
        Body::Passthrough(PassthroughBody {
            writer: Mutex::new(Some(writer)),
        })
    }

    pub async fn write(&self, chunk: Bytes) -> Result<usize> {
        match self {
            Body::File(f) => {
                {
                    let mut file = f.file.lock().expect("body file");
                    file.write_all(&chunk).context("write body file")?;
                }
                f.subscription.notify_all();
                Ok(chunk.len())
            }
            Body::Buffer(b) => {
                b.buf
                    .write()
                    .expect("body buffer")
                    .extend_from_slice(&chunk);
                b.subscription.notify_all();
                Ok(chunk.len())
            }
            Body::Passthrough(p) => match p.sink() {
                Some(sink) => sink.write_chunk(chunk).await,
                None => Err(anyhow!("body already closed")),
            },
        }
    }

    pub async fn flush(&self) -> Result<()> {
        match self {
            Body::File(f) => {
                f.file
                    .lock()
                    .expect("body file")
                    .sync_data()
                    .context("sync body file")?;
                f.subscription.notify_all();
                Ok(())
            }
            Body::Buffer(b) => {
                b.subscription.notify_all();
                Ok(())
            }
            Body::Passthrough(p) => match p.sink() {
                Some(sink) => sink.flush_output().await,
                None => Ok(()),
            },
        }
    }

    /// Signals that no more bytes will be written. Blocked readers drain
    /// whatever remains and then observe end of stream.
    pub fn close(&self) {
        match self {
            Body::File(f) => {
                let _ = f.file.lock().expect("body file").sync_data();
                f.subscription.close();
            }
            Body::Buffer(b) => b.subscription.close(),
            Body::Passthrough(p) => {
                p.writer.lock().expect("passthrough writer").take();
            }
        }
    }

    /// Waits for every reader to finish, then releases the backing storage.
    /// The writer must have called [`Body::close`] first.
    pub async fn clean(&self) -> Result<()> {
        match self {
            Body::File(f) => {
                f.subscription.wait_all().await;
                std::fs::remove_file(&f.path)
                    .with_context(|| format!("remove body file {}", f.path.display()))
            }
            Body::Buffer(b) => {
                b.subscription.wait_all().await;
                Ok(())
            }
            Body::Passthrough(_) => Ok(()),
        }
    }

    /// Opens a reader anchored at offset 0, with its own file descriptor for
    /// file-backed stores.
    pub fn reader(&self) -> Result<BodyReader> {
        match self {
            Body::File(f) => {
                let file = File::open(&f.path)
                    .with_context(|| format!("open body file {}", f.path.display()))?;
                Ok(BodyReader {
                    source: ReaderSource::File(file),
                    subscriber: f.subscription.subscribe(),
                })
            }
            Body::Buffer(b) => Ok(BodyReader {
                source: ReaderSource::Buffer {
                    buf: Arc::clone(&b.buf),
                    pos: 0,
                },
                subscriber: b.subscription.subscribe(),
            }),
            Body::Passthrough(_) => Err(anyhow!("passthrough body has no reader")),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Body::File(f) => Some(&f.path),
            _ => None,
        }
    }
}

impl PassthroughBody {
    fn sink(&self) -> Option<Arc<dyn ResponseWriter>> {
        self.writer.lock().expect("passthrough writer").clone()
    }
}

/// Reader over a file or buffer body. Reaching the current end of the stream
/// blocks until the writer notifies or closes; end of stream is only
/// reported after the writer has closed.
pub struct BodyReader {
    source: ReaderSource,
    subscriber: Subscriber,
}

enum ReaderSource {
    File(File),
    Buffer { buf: Arc<RwLock<Vec<u8>>>, pos: usize },
}

impl BodyReader {
    /// Reads available bytes into `dst`. Returns 0 only at true end of
    /// stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        loop {
            let n = self.read_available(dst)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.subscriber.wait().await {
                // Subscription closed: one final read picks up anything
                // written between our last read and the close.
                return self.read_available(dst);
            }
        }
    }

    /// Drains the stream to its end, waiting for the writer as needed.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn read_available(&mut self, dst: &mut [u8]) -> Result<usize> {
        match &mut self.source {
            ReaderSource::File(file) => file.read(dst).context("read body file"),
            ReaderSource::Buffer { buf, pos } => {
                let data = buf.read().expect("body buffer");
                let n = data.len().saturating_sub(*pos).min(dst.len());
                dst[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}
