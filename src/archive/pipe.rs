//! Producer-thread pipe backing archive streams.
//!
//! The archive is written on a dedicated thread into a bounded channel and
//! read back through [`PipeReader`]. Dropping the receiving side makes the
//! producer's next write fail with `BrokenPipe`, which stops it.

use std::io::{self, BufWriter, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};

use tracing::debug;

use super::{ArchiveError, ArchiveResult, ArchiveStream};

const CHUNK_SIZE: usize = 32 * 1024;
const CHANNEL_DEPTH: usize = 8;

type Chunk = io::Result<Vec<u8>>;

struct PipeWriter {
    tx: SyncSender<Chunk>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.send(Ok(buf.to_vec())).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive stream closed by reader")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reading end of an archive produced on a background thread.
pub struct PipeReader {
    rx: Option<Receiver<Chunk>>,
    chunk: Vec<u8>,
    pos: usize,
    producer: Option<JoinHandle<ArchiveResult<()>>>,
    reported: bool,
}

impl PipeReader {
    /// Run `produce` on a new thread, streaming what it writes.
    pub fn spawn<F>(name: &str, produce: F) -> ArchiveResult<Self>
    where
        F: FnOnce(&mut dyn Write) -> ArchiveResult<()> + Send + 'static,
    {
        let (tx, rx) = sync_channel::<Chunk>(CHANNEL_DEPTH);
        let producer = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut writer = BufWriter::with_capacity(CHUNK_SIZE, PipeWriter { tx: tx.clone() });
            let result = produce(&mut writer).and_then(|()| Ok(writer.flush()?));
            if let Err(e) = &result {
                // Discard what is still buffered so nothing follows the error.
                let _ = writer.into_parts();
                // The reader may already be gone; nothing to report to then.
                let _ = tx.send(Err(io::Error::other(e.to_string())));
            }
            result
        })?;

        Ok(Self { rx: Some(rx), chunk: Vec::new(), pos: 0, producer: Some(producer), reported: false })
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            let Some(rx) = &self.rx else {
                return Err(io::Error::other("archive stream is closed"));
            };
            match rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.reported = true;
                    return Err(e);
                }
                // Producer finished and hung up.
                Err(_) => return Ok(0),
            }
        }
    }
}

impl ArchiveStream for PipeReader {
    fn close(&mut self) -> io::Result<()> {
        self.rx = None;
        self.chunk = Vec::new();
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };

        match producer.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ArchiveError::Io(e))) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Archive stream closed before the producer finished");
                Ok(())
            }
            Ok(Err(e)) if self.reported => {
                debug!("Archive producer failed (already reported to reader): {}", e);
                Ok(())
            }
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => Err(io::Error::other("archive producer panicked")),
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
