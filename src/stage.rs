//! Concurrent pipeline stages and the reduction of their outcomes.
//!
//! Each stage is a named thread that reports exactly one result through its
//! join handle. The orchestrator joins every stage it started, then
//! `settle` picks the single error the caller sees.

use anyhow::{anyhow, Context, Result};
use std::io::{self, Read};
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::error::{find_pipe_error, TransferError};
use crate::pipe::{PipeReader, PipeWriter};

pub struct Stage<T> {
    name: &'static str,
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> Stage<T> {
    pub fn spawn<F>(name: &'static str, work: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("treepipe-{name}"))
            .spawn(work)
            .with_context(|| format!("failed to start {name} stage"))?;
        Ok(Stage { name, handle })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the stage's terminal result
    pub fn join(self) -> Result<T> {
        let name = self.name;
        self.handle
            .join()
            .map_err(|_| anyhow!("{name} stage panicked"))?
    }
}

/// Run `adapt` as its own stage between two pipes.
///
/// `adapt` must consume its whole input; bytes left over after it returns
/// are reported as corrupt data. On success the output is closed, so the
/// stages on both sides see a clean end-of-stream. On failure the input is
/// closed and the output aborted, which unblocks both neighbours.
pub fn bridge<F>(
    name: &'static str,
    mut input: PipeReader,
    mut output: PipeWriter,
    adapt: F,
) -> Result<Stage<u64>>
where
    F: FnOnce(&mut PipeReader, &mut PipeWriter) -> io::Result<u64> + Send + 'static,
{
    Stage::spawn(name, move || {
        let result = adapt(&mut input, &mut output).and_then(|n| match drain(&mut input)? {
            0 => Ok(n),
            extra => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{extra} unexpected bytes after end of stream"),
            )),
        });
        match result {
            Ok(n) => {
                output.close()?;
                Ok(n)
            }
            Err(err) => {
                input.close();
                output.abort(&err);
                Err(anyhow::Error::new(err).context(format!("{name} failed")))
            }
        }
    })
}

/// Errors that only report that a neighbouring stage went away first.
pub fn is_secondary(err: &anyhow::Error) -> bool {
    find_pipe_error(err).is_some()
}

/// Reduce stage outcomes to one result.
///
/// Cancellation wins over everything once the scope is cancelled. Otherwise
/// the first error (in the order given) that is not merely a broken pipe is
/// reported; if every failure is secondary, the first one is.
pub fn settle(cancel: &CancelToken, outcomes: Vec<(&'static str, Result<()>)>) -> Result<()> {
    let mut first_secondary = None;
    for (_stage, outcome) in outcomes {
        let Err(err) = outcome else { continue };
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }
        if !is_secondary(&err) {
            return Err(err);
        }
        first_secondary.get_or_insert(err);
    }
    match first_secondary {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Read everything left in `reader` so its writer can finish cleanly
pub fn drain(reader: &mut dyn Read) -> io::Result<u64> {
    io::copy(reader, &mut io::sink())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_cancelled;
    use crate::pipe::{pipe, PipeError};
    use std::io::Write;

    #[test]
    fn test_join_reports_panic() {
        let stage = Stage::spawn("boom", || -> Result<()> { panic!("stage blew up") }).unwrap();
        let err = stage.join().unwrap_err();
        assert_eq!(err.to_string(), "boom stage panicked");
    }

    #[test]
    fn test_settle_prefers_primary_error() {
        let cancel = CancelToken::new();
        let secondary = anyhow::Error::new(io::Error::from(PipeError::ReaderClosed));
        let primary = anyhow!("disk full");

        let err = settle(
            &cancel,
            vec![("put", Err(secondary)), ("archive", Err(primary)), ("compress", Ok(()))],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");

        assert!(settle(&cancel, vec![("put", Ok(())), ("archive", Ok(()))]).is_ok());
    }

    #[test]
    fn test_settle_falls_back_to_secondary() {
        let cancel = CancelToken::new();
        let err = settle(
            &cancel,
            vec![
                ("put", Ok(())),
                ("archive", Err(anyhow::Error::new(io::Error::from(PipeError::WriterDropped)))),
            ],
        )
        .unwrap_err();
        assert!(is_secondary(&err));
    }

    #[test]
    fn test_settle_reports_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = settle(&cancel, vec![("put", Err(anyhow!("connection reset")))]).unwrap_err();
        assert!(is_cancelled(&err));

        // A transfer that finished before noticing the cancel still succeeded.
        assert!(settle(&cancel, vec![("put", Ok(()))]).is_ok());
    }

    #[test]
    fn test_bridge_copies_and_closes() {
        let (upstream_rx, mut upstream_tx) = pipe();
        let (mut downstream_rx, downstream_tx) = pipe();
        let stage = bridge("upper", upstream_rx, downstream_tx, |input, output| {
            let mut buf = Vec::new();
            input.read_to_end(&mut buf)?;
            output.write_all(&buf.to_ascii_uppercase())?;
            Ok(buf.len() as u64)
        })
        .unwrap();

        let producer = thread::spawn(move || -> io::Result<()> {
            upstream_tx.write_all(b"hello")?;
            upstream_tx.close()
        });
        let mut out = Vec::new();
        downstream_rx.read_to_end(&mut out).unwrap();

        producer.join().unwrap().unwrap();
        assert_eq!(stage.join().unwrap(), 5);
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn test_bridge_rejects_trailing_input() {
        let (upstream_rx, mut upstream_tx) = pipe();
        let (mut downstream_rx, downstream_tx) = pipe();
        let stage = bridge("short", upstream_rx, downstream_tx, |input, output| {
            let mut head = [0u8; 2];
            input.read_exact(&mut head)?;
            output.write_all(&head)?;
            Ok(2)
        })
        .unwrap();

        let producer = thread::spawn(move || {
            let _ = upstream_tx.write_all(b"hello").and_then(|_| upstream_tx.close());
        });
        assert!(downstream_rx.read_to_end(&mut Vec::new()).is_err());

        producer.join().unwrap();
        let err = stage.join().unwrap_err();
        assert!(format!("{err:#}").contains("3 unexpected bytes"));
        assert!(!is_secondary(&err));
    }

    #[test]
    fn test_bridge_failure_unblocks_neighbours() {
        let (upstream_rx, mut upstream_tx) = pipe();
        let (mut downstream_rx, downstream_tx) = pipe();
        let stage = bridge("broken", upstream_rx, downstream_tx, |_, _| {
            Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt frame"))
        })
        .unwrap();

        let err = downstream_rx.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("corrupt frame"));

        let mut data = vec![0u8; 1 << 20];
        data[0] = 1;
        assert_eq!(
            upstream_tx.write_all(&data).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );

        let err = stage.join().unwrap_err();
        assert!(format!("{err:#}").contains("corrupt frame"));
        assert!(!is_secondary(&err));
    }
}
