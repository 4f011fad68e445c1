//! A [`ThreadReader`] allows for pushing the reading and decoding of the input streams onto a
//! separate thread.
//!
//! The inputs are opened on the reader thread itself, so the underlying readers need not be `Send`.
//!
//! Read sets are sent over a bounded channel in chunks of `chunksize`, in input order. An error
//! ends the stream: any read sets decoded before it are sent first, followed by the error.

use std::{io::BufRead, num::NonZeroUsize, thread::JoinHandle};

use flume::{bounded, Receiver};
use log::{debug, error};

use crate::{errors::Result, sync_reader::ReadSet, sync_reader::SyncReader};

/// The number of chunks to allow in the reader channel at one time.
const READER_CHANNEL_SIZE: usize = 100;

/// A contiguous run of read sets, or the error that ended the input.
pub type Chunk = Result<Vec<ReadSet>>;

/// A struct to hold onto the handle for a thread that is reading chunks of read sets.
pub struct ThreadReader {
    /// The [`JoinHandle`] for the thread that is reading.
    pub handle: JoinHandle<()>,
    /// The channel that will be receiving chunks.
    pub rx: Receiver<Chunk>,
}

impl ThreadReader {
    /// Open the inputs with `open` on a new thread and read them `chunksize` read sets at a time.
    ///
    /// A failure to open is sent as the only chunk. The thread stops early if the receiving side
    /// is dropped.
    pub fn new<R, O>(open: O, chunksize: NonZeroUsize) -> Self
    where
        R: BufRead + 'static,
        O: FnOnce() -> Result<SyncReader<R>> + Send + 'static,
    {
        let (tx, rx) = bounded(READER_CHANNEL_SIZE);
        let chunksize = usize::from(chunksize);
        let handle = std::thread::spawn(move || {
            let mut reader = match open() {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            loop {
                let mut chunk = Vec::with_capacity(chunksize);
                let mut error = None;
                while chunk.len() < chunksize {
                    match reader.next_read_set() {
                        Ok(Some(read_set)) => chunk.push(read_set),
                        Ok(None) => break,
                        Err(e) => {
                            error = Some(e);
                            break;
                        }
                    }
                }
                let exhausted = chunk.len() < chunksize;
                if !chunk.is_empty() && tx.send(Ok(chunk)).is_err() {
                    debug!("Reader channel closed; stopping the reader thread");
                    return;
                }
                if let Some(e) = error {
                    // The receiver may already be gone; there is nobody left to report to.
                    let _ = tx.send(Err(e));
                    return;
                }
                if exhausted {
                    return;
                }
            }
        });

        Self { handle, rx }
    }

    /// Drop the receiving side, letting the reader thread stop, and wait for it to finish.
    pub fn join(self) {
        let Self { handle, rx } = self;
        drop(rx);
        if handle.join().is_err() {
            error!("The reader thread panicked");
        }
    }
}
