//! Async-signal to event-loop bridge
//!
//! Signal handlers run in an unsafe context where almost nothing is legal.
//! One thing that is: writing to an open file descriptor. Each bridged
//! signal gets a socketpair; the raw handler writes one byte to the write
//! side, and the event loop awaits readability on the other end. This is
//! the only place async signal delivery touches the rest of the daemon.
//!
//! One bridge per signal number, enforced by a process-wide table of
//! write-side fds, the only state the raw handler reads. Bridges are
//! created by startup code and handed to the event loop.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

const FD_UNSET: i32 = -1;

/// Write-side fds indexed by signal number; -1 means no bridge installed
static WRITE_FDS: [AtomicI32; 64] = [const { AtomicI32::new(FD_UNSET) }; 64];

/// The raw handler. Only fd writes are async-signal-safe; the diagnostics
/// below go through libc::write for that reason.
extern "C" fn forward_signal(signo: libc::c_int) {
    fn emit(msg: &str) {
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
            );
        }
    }

    if signo < 0 || signo as usize >= WRITE_FDS.len() {
        emit("ignored out-of-range signal\n");
        return;
    }

    let fd = WRITE_FDS[signo as usize].load(Ordering::Relaxed);
    if fd == FD_UNSET {
        emit("ignored unbridged signal\n");
        return;
    }

    let byte = 0u8;
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("a bridge for {0} already exists")]
    AlreadyBridged(Signal),

    #[error("failed to create socketpair for {signal}: {source}")]
    Pair {
        signal: Signal,
        source: std::io::Error,
    },

    #[error("failed to install handler for {signal}: {source}")]
    Install { signal: Signal, source: nix::Error },
}

/// One bridged signal, owned by the event loop
#[derive(Debug)]
pub struct SignalBridge {
    signal: Signal,
    reader: UnixStream,
    // Keeps the handler's write fd alive for the bridge's lifetime
    _writer: StdUnixStream,
}

impl SignalBridge {
    /// Install the handler for `signal` and return its bridge.
    ///
    /// Must run inside the tokio runtime. A second bridge for the same
    /// signal is an error.
    pub fn new(signal: Signal) -> Result<Self, SignalError> {
        let pair_err = |source| SignalError::Pair { signal, source };

        let (reader, writer) = StdUnixStream::pair().map_err(pair_err)?;
        reader.set_nonblocking(true).map_err(pair_err)?;
        let reader = UnixStream::from_std(reader).map_err(pair_err)?;

        let slot = &WRITE_FDS[signal as usize];
        if slot
            .compare_exchange(
                FD_UNSET,
                writer.as_raw_fd(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(SignalError::AlreadyBridged(signal));
        }

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            slot.store(FD_UNSET, Ordering::SeqCst);
            return Err(SignalError::Install { signal, source: e });
        }

        Ok(Self {
            signal,
            reader,
            _writer: writer,
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Wait for the next delivery of this signal
    pub async fn recv(&mut self) {
        let mut byte = [0u8; 1];
        if let Err(e) = self.reader.read_exact(&mut byte).await {
            log::warn!("error draining {} bridge (ignored): {}", self.signal, e);
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        // Handler must stop writing into a closing fd
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let _ = unsafe { sigaction(self.signal, &action) };
        WRITE_FDS[self.signal as usize].store(FD_UNSET, Ordering::SeqCst);
    }
}
