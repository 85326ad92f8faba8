//! Per-fd stdio pipe with lifecycle management
//!
//! Each piped child fd is backed by one `socketpair(2)`: the child end is
//! handed to the spawn descriptor, the parent end is bound to the reactor as
//! a `UnixStream`. A pipe that is readable (parent writes input to the
//! child) has its input written in full and the write side shut down; a pipe
//! that is writable (parent reads child output) is read to EOF into its
//! output chain.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::buffer::OutputChain;
use crate::error::{io_errno, Result};

/// Discard-read chunk size once the capture budget is spent.
const DISCARD_CHUNK: usize = 16 * 1024;

/// Coarse phase of a pipe, gating valid operations and ordered teardown.
///
/// Transitions are strictly Uninitialized → Initialized → Started →
/// Closing → Closed; a pipe may be dropped only in the first or last state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Lifecycle {
    Uninitialized,
    Initialized,
    Started,
    Closing,
    Closed,
}

/// Notification sent from a pipe driver to the runner's control loop.
#[derive(Debug)]
pub(crate) enum PipeEvent {
    /// Bytes committed to an output chain
    Data(usize),
    /// Negative result from a read, write or shutdown
    Error(Errno),
}

/// Shared cap on committed output across every captured pipe of a run.
///
/// Every driver must pass freshly read bytes through `admit` before
/// committing them. The counter is the single serialization point across
/// all pipes: a chunk is committed only if the counter had not crossed the
/// cap when the chunk was admitted, so no matter how many pipes drain
/// concurrently, at most one chunk crosses the cap and total committed
/// output stays within cap + one read quantum. Past the cap a driver keeps
/// reading to EOF but commits nothing further.
pub(crate) struct CaptureBudget {
    admitted: AtomicUsize,
    cap: usize,
}

impl CaptureBudget {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            admitted: AtomicUsize::new(0),
            cap,
        }
    }

    /// Account `n` freshly read bytes; true when they may be committed,
    /// false once the budget is spent.
    pub(crate) fn admit(&self, n: usize) -> bool {
        self.admitted.fetch_add(n, Ordering::Relaxed) <= self.cap
    }

    fn spent(&self) -> bool {
        self.admitted.load(Ordering::Relaxed) > self.cap
    }
}

/// One stdio slot of the child, owned by the runner.
pub(crate) struct StdioPipe {
    readable: bool,
    writable: bool,
    input: Vec<u8>,
    chain: OutputChain,
    stream: Option<UnixStream>,
    child_end: Option<OwnedFd>,
    lifecycle: Lifecycle,
}

impl StdioPipe {
    /// Directions are from the parent's perspective: `readable` means the
    /// parent feeds input into the child, `writable` means the parent
    /// captures output from the child. At least one must be set.
    pub(crate) fn new(readable: bool, writable: bool, input: Vec<u8>) -> Self {
        assert!(readable || writable);
        Self {
            readable,
            writable,
            input,
            chain: OutputChain::new(),
            stream: None,
            child_end: None,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Create the fd pair and bind the parent end to the reactor.
    ///
    /// On failure the pipe stays Uninitialized and holds no handles. Must
    /// be called from within the runner's reactor context.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        debug_assert_eq!(self.lifecycle, Lifecycle::Uninitialized);

        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let parent = std::os::unix::net::UnixStream::from(parent);
        parent.set_nonblocking(true)?;
        self.stream = Some(UnixStream::from_std(parent)?);
        self.child_end = Some(child);

        self.lifecycle = Lifecycle::Initialized;
        Ok(())
    }

    /// Hand the child end over to the spawn descriptor. The caller must
    /// keep it alive until the spawn happened and drop it afterwards,
    /// otherwise the parent end never sees EOF.
    pub(crate) fn take_child_end(&mut self) -> Option<OwnedFd> {
        self.child_end.take()
    }

    /// Drive the pipe to completion: feed input and half-close if readable,
    /// pump output to EOF if writable. Data increments and I/O errors are
    /// reported through `events`.
    ///
    /// Consumes and returns the pipe so the runner can reclaim it, Closed,
    /// when the driver task is joined.
    pub(crate) async fn drive(
        mut self,
        events: mpsc::UnboundedSender<PipeEvent>,
        budget: Option<Arc<CaptureBudget>>,
    ) -> Self {
        debug_assert_eq!(self.lifecycle, Lifecycle::Initialized);
        // Mark the pipe busy before any I/O is issued; if a sub-step fails
        // there is no recovery beyond the normal close path.
        self.lifecycle = Lifecycle::Started;

        let Some(stream) = self.stream.take() else {
            self.lifecycle = Lifecycle::Closed;
            return self;
        };
        let (read_half, write_half) = stream.into_split();

        let readable = self.readable;
        let writable = self.writable;
        let input = std::mem::take(&mut self.input);
        let mut chain = std::mem::take(&mut self.chain);

        let write_side = async {
            if readable {
                feed_input(write_half, input).await
            } else {
                // Not feeding input; release the write direction right away.
                drop(write_half);
                None
            }
        };
        let read_side = async {
            if writable {
                pump_output(read_half, &mut chain, &events, budget.as_deref()).await
            } else {
                drop(read_half);
                None
            }
        };

        let (write_err, read_err) = tokio::join!(write_side, read_side);
        for errno in [write_err, read_err].into_iter().flatten() {
            let _ = events.send(PipeEvent::Error(errno));
        }

        self.chain = chain;
        // Both halves are gone at this point; entering Closed corresponds
        // to the handle's close callback having fired.
        self.lifecycle = Lifecycle::Closing;
        self.lifecycle = Lifecycle::Closed;
        debug!(captured = self.output_len(), "stdio pipe drained");
        self
    }

    /// Close a pipe that never started (setup aborted before spawn or the
    /// spawn itself failed). Releases both ends.
    pub(crate) fn close(&mut self) {
        debug_assert!(matches!(
            self.lifecycle,
            Lifecycle::Initialized | Lifecycle::Started
        ));
        self.lifecycle = Lifecycle::Closing;
        self.stream = None;
        self.child_end = None;
        self.lifecycle = Lifecycle::Closed;
        debug!("closed unstarted stdio pipe");
    }

    /// Total bytes captured so far.
    pub(crate) fn output_len(&self) -> usize {
        self.chain.len()
    }

    /// Materialize the captured output as one contiguous byte vector.
    /// Valid only once the pipe is Closed.
    pub(crate) fn output_bytes(&self) -> Vec<u8> {
        debug_assert_eq!(self.lifecycle, Lifecycle::Closed);
        self.chain.to_bytes()
    }
}

impl Drop for StdioPipe {
    fn drop(&mut self) {
        // Pipes are only destructible before any handle exists or after
        // the close path ran; anything else is a teardown-ordering bug.
        debug_assert!(matches!(
            self.lifecycle,
            Lifecycle::Uninitialized | Lifecycle::Closed
        ));
    }
}

/// Write the full input slice, then shut down the write direction so the
/// child sees EOF on its end.
async fn feed_input(mut write_half: OwnedWriteHalf, input: Vec<u8>) -> Option<Errno> {
    if !input.is_empty() {
        if let Err(err) = write_half.write_all(&input).await {
            return Some(io_errno(&err));
        }
    }
    if let Err(err) = write_half.shutdown().await {
        return Some(io_errno(&err));
    }
    None
}

/// Read child output into the chain until EOF or error.
///
/// EOF is not an error. A failed read stops reading and reports the errno.
/// Every chunk is admitted against the shared budget after it was read and
/// before it is committed; once the budget is spent, reads continue into a
/// scratch buffer but nothing more is committed.
async fn pump_output(
    mut read_half: OwnedReadHalf,
    chain: &mut OutputChain,
    events: &mpsc::UnboundedSender<PipeEvent>,
    budget: Option<&CaptureBudget>,
) -> Option<Errno> {
    let mut discard: Option<Vec<u8>> = None;

    loop {
        if discard.is_none() && budget.is_some_and(|b| b.spent()) {
            discard = Some(vec![0u8; DISCARD_CHUNK]);
        }

        let result = match discard.as_deref_mut() {
            Some(scratch) => read_half.read(scratch).await,
            None => read_half.read(chain.reserve()).await,
        };

        match result {
            // EOF; the reactor stops reading implicitly.
            Ok(0) => return None,
            Ok(n) => {
                if discard.is_none() {
                    // Another pipe may have spent the budget while this
                    // read was in flight; the reserved bytes stay
                    // uncommitted in that case.
                    if budget.is_some_and(|b| !b.admit(n)) {
                        discard = Some(vec![0u8; DISCARD_CHUNK]);
                    } else {
                        chain.commit(n);
                        let _ = events.send(PipeEvent::Data(n));
                    }
                }
            }
            Err(err) => return Some(io_errno(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    #[should_panic]
    fn pipe_requires_a_direction() {
        StdioPipe::new(false, false, Vec::new());
    }

    #[test]
    fn initialize_binds_both_ends() {
        let rt = runtime();
        rt.block_on(async {
            let mut pipe = StdioPipe::new(false, true, Vec::new());
            pipe.initialize().unwrap();
            assert_eq!(pipe.lifecycle(), Lifecycle::Initialized);
            assert!(pipe.take_child_end().is_some());
            pipe.close();
            assert_eq!(pipe.lifecycle(), Lifecycle::Closed);
        });
    }

    #[test]
    fn drive_captures_child_end_writes_in_order() {
        let rt = runtime();
        rt.block_on(async {
            let mut pipe = StdioPipe::new(false, true, Vec::new());
            pipe.initialize().unwrap();
            let child_end = pipe.take_child_end().unwrap();

            // Pretend to be the child: write two chunks, then close.
            let writer = std::thread::spawn(move || {
                use std::io::Write;
                let mut sock = std::os::unix::net::UnixStream::from(child_end);
                sock.write_all(b"first ").unwrap();
                sock.write_all(b"second").unwrap();
            });

            let (tx, mut rx) = mpsc::unbounded_channel();
            let pipe = pipe.drive(tx, None).await;
            writer.join().unwrap();

            assert_eq!(pipe.lifecycle(), Lifecycle::Closed);
            assert_eq!(pipe.output_bytes(), b"first second");

            let mut total = 0;
            while let Ok(PipeEvent::Data(n)) = rx.try_recv() {
                total += n;
            }
            assert_eq!(total, pipe.output_len());
        });
    }

    #[test]
    fn drive_feeds_input_then_half_closes() {
        let rt = runtime();
        rt.block_on(async {
            let mut pipe = StdioPipe::new(true, false, b"payload".to_vec());
            pipe.initialize().unwrap();
            let child_end = pipe.take_child_end().unwrap();

            let reader = std::thread::spawn(move || {
                use std::io::Read;
                let mut sock = std::os::unix::net::UnixStream::from(child_end);
                let mut buf = Vec::new();
                // Reaching EOF proves the half-close happened.
                sock.read_to_end(&mut buf).unwrap();
                buf
            });

            let (tx, _rx) = mpsc::unbounded_channel();
            let pipe = pipe.drive(tx, None).await;

            assert_eq!(pipe.lifecycle(), Lifecycle::Closed);
            assert_eq!(reader.join().unwrap(), b"payload");
        });
    }

    #[test]
    fn spent_budget_discards_further_output() {
        let rt = runtime();
        rt.block_on(async {
            let mut pipe = StdioPipe::new(false, true, Vec::new());
            pipe.initialize().unwrap();
            let child_end = pipe.take_child_end().unwrap();

            let budget = Arc::new(CaptureBudget::new(10));
            budget.admit(11);

            let writer = std::thread::spawn(move || {
                use std::io::Write;
                let mut sock = std::os::unix::net::UnixStream::from(child_end);
                sock.write_all(&[0u8; 4096]).unwrap();
            });

            let (tx, _rx) = mpsc::unbounded_channel();
            let pipe = pipe.drive(tx, Some(budget)).await;
            writer.join().unwrap();
            assert_eq!(pipe.output_len(), 0);
        });
    }

    #[test]
    fn budget_admits_at_most_one_chunk_past_the_cap() {
        let budget = CaptureBudget::new(100);
        assert!(budget.admit(100));
        assert!(!budget.spent());
        // The crossing chunk is still admitted; overflow detection is
        // post-commit.
        assert!(budget.admit(50));
        assert!(budget.spent());
        assert!(!budget.admit(1));
    }
}
