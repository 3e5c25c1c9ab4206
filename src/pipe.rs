//! In-memory byte pipe between two pipeline stages.
//!
//! The writer accumulates up to `chunk_size` bytes and hands each chunk over
//! a bounded channel (`depth` 0 is a rendezvous: a send blocks until the
//! reader takes it), so at most a few chunks are ever in memory no matter
//! how large the stream is.
//!
//! A clean end-of-stream only happens through `PipeWriter::close`. A writer
//! that is aborted or simply dropped makes the reader fail instead, so a
//! consumer can never mistake a failed producer for a short stream.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use thiserror::Error;

use crate::cancel::CancelToken;

/// How often a blocked reader re-checks its cancellation scope
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Pipe sizing
#[derive(Debug, Clone, Copy)]
pub struct PipeConfig {
    /// Bytes accumulated before a chunk is handed to the reader
    pub chunk_size: usize,
    /// Chunks that may wait in the channel (0 = rendezvous)
    pub depth: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig {
            chunk_size: 64 * 1024,
            depth: 0,
        }
    }
}

/// Failures observed on one end of a pipe because of the other end.
#[derive(Debug, Clone, Error)]
pub enum PipeError {
    #[error("read end of pipe closed")]
    ReaderClosed,
    #[error("write end of pipe dropped without close")]
    WriterDropped,
    #[error("pipe aborted by writer: {0}")]
    Aborted(String),
    #[error("pipe end already closed")]
    Closed,
    #[error("pipe cancelled")]
    Cancelled,
}

impl From<PipeError> for io::Error {
    fn from(err: PipeError) -> Self {
        let kind = match err {
            PipeError::ReaderClosed => io::ErrorKind::BrokenPipe,
            PipeError::WriterDropped => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

enum Frame {
    Data(Vec<u8>),
    Abort(String),
    Eof,
}

/// Create a pipe that is never cancelled
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with(&PipeConfig::default(), &CancelToken::new())
}

/// Create a pipe whose blocked reads give up once `cancel` fires
pub fn pipe_with(config: &PipeConfig, cancel: &CancelToken) -> (PipeReader, PipeWriter) {
    let chunk_size = config.chunk_size.max(1);
    let (tx, rx) = mpsc::sync_channel(config.depth);
    let reader = PipeReader {
        rx: Some(rx),
        buffer: Vec::new(),
        buffer_pos: 0,
        state: ReadState::Open,
        cancel: cancel.clone(),
    };
    let writer = PipeWriter {
        tx: Some(tx),
        buffer: Vec::with_capacity(chunk_size),
        chunk_size,
        cancel: cancel.clone(),
    };
    (reader, writer)
}

/// Producer end
pub struct PipeWriter {
    tx: Option<SyncSender<Frame>>,
    buffer: Vec<u8>,
    chunk_size: usize,
    cancel: CancelToken,
}

impl PipeWriter {
    fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.cancel.check()?;
        let delivered = match self.tx.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => return Err(PipeError::Closed.into()),
        };
        if !delivered {
            self.tx = None;
            return Err(PipeError::ReaderClosed.into());
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.send(Frame::Data(chunk))?;
        }
        Ok(())
    }

    /// Flush pending bytes and signal end-of-stream. Blocks until the reader
    /// has taken the last chunk. A second call is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        let result = self.flush_buffer().and_then(|_| self.send(Frame::Eof));
        self.tx = None;
        result
    }

    /// Make the reader fail with `reason` instead of seeing end-of-stream.
    /// Pending bytes are discarded. A second call is a no-op.
    pub fn abort(&mut self, reason: impl std::fmt::Display) {
        if let Some(tx) = self.tx.take() {
            self.buffer.clear();
            // The reader may already be gone; nothing left to tell it then.
            let _ = tx.send(Frame::Abort(reason.to_string()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_none() {
            return Err(PipeError::Closed.into());
        }
        let mut written = 0;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            written += to_write;
            remaining = &remaining[to_write..];

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

#[derive(Debug, Clone)]
enum ReadState {
    Open,
    Eof,
    Failed(PipeError),
}

/// Consumer end
pub struct PipeReader {
    rx: Option<Receiver<Frame>>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    state: ReadState,
    cancel: CancelToken,
}

impl PipeReader {
    /// Stop reading. Pending and future writes on the other end fail with
    /// `PipeError::ReaderClosed`. A second call is a no-op.
    pub fn close(&mut self) {
        self.rx = None;
        self.buffer.clear();
        self.buffer_pos = 0;
        if matches!(self.state, ReadState::Open) {
            self.state = ReadState::Failed(PipeError::Closed);
        }
    }

    fn fail(&mut self, err: PipeError) -> io::Error {
        self.rx = None;
        self.state = ReadState::Failed(err.clone());
        err.into()
    }

    fn next_chunk(&mut self) -> io::Result<bool> {
        loop {
            let Some(rx) = self.rx.as_ref() else {
                return Err(self.fail(PipeError::Closed));
            };
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(Frame::Data(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.buffer = chunk;
                    self.buffer_pos = 0;
                    return Ok(true);
                }
                Ok(Frame::Eof) => {
                    self.rx = None;
                    self.state = ReadState::Eof;
                    return Ok(false);
                }
                Ok(Frame::Abort(reason)) => return Err(self.fail(PipeError::Aborted(reason))),
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        return Err(self.fail(PipeError::Cancelled));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.fail(PipeError::WriterDropped))
                }
            }
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer_pos >= self.buffer.len() {
            match &self.state {
                ReadState::Open => {}
                ReadState::Eof => return Ok(0),
                ReadState::Failed(err) => return Err(err.clone().into()),
            }
            if !self.next_chunk()? {
                return Ok(0);
            }
        }

        let available = self.buffer.len() - self.buffer_pos;
        let to_copy = available.min(buf.len());
        buf[..to_copy].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + to_copy]);
        self.buffer_pos += to_copy;
        Ok(to_copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small() -> PipeConfig {
        PipeConfig {
            chunk_size: 4,
            depth: 0,
        }
    }

    #[test]
    fn test_bytes_arrive_in_order() {
        let (mut reader, mut writer) = pipe_with(&small(), &CancelToken::new());
        let producer = thread::spawn(move || -> io::Result<()> {
            for i in 0..100u8 {
                writer.write_all(&[i, i, i])?;
            }
            writer.close()
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap().unwrap();

        let expected: Vec<u8> = (0..100u8).flat_map(|i| [i, i, i]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_closed_reader_fails_writes() {
        let (mut reader, mut writer) = pipe_with(&small(), &CancelToken::new());
        reader.close();
        reader.close();

        let err = writer.write_all(b"hello world").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_abort_reaches_reader() {
        let (mut reader, mut writer) = pipe_with(&small(), &CancelToken::new());
        let producer = thread::spawn(move || {
            writer.write_all(b"abcd").unwrap();
            writer.abort("walk failed");
            writer.abort("ignored");
        });

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        producer.join().unwrap();
        assert!(err.to_string().contains("walk failed"));
        assert_eq!(out, b"abcd");
        // The failure is sticky.
        assert!(reader.read(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_dropped_writer_is_not_eof() {
        let (mut reader, writer) = pipe();
        drop(writer);
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_double_close_writer() {
        let (mut reader, mut writer) = pipe();
        let consumer = thread::spawn(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map(|_| out)
        });
        writer.write_all(b"xy").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(writer.write(b"z").is_err());
        assert_eq!(consumer.join().unwrap().unwrap(), b"xy");
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let cancel = CancelToken::new();
        let (mut reader, _writer) = pipe_with(&small(), &cancel);
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        canceller.join().unwrap();
        assert!(err.to_string().contains("cancelled"));
    }
}
