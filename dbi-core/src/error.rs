//! The module containing the crate main [`Error`] type

use std::fmt::Display;
use std::path::PathBuf;

/// The destination a [`Error::ShortWrite`] happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDestination {
    /// The named pipe used in online mode
    Pipe,
    /// The per-thread offline trace file
    File,
}

impl Display for WriteDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe => write!(f, "pipe"),
            Self::File => write!(f, "file"),
        }
    }
}

/// The main error type of the tracer core
///
/// Every variant here is a fatal condition as classified by the error handling design: none of
/// these originate from the inline code-cache path, only from clean-call trampolines and
/// lifecycle entry points. The inline path degrades silently (a dropped entry, a skipped
/// annotation) and logs at most, since it cannot unwind through instrumented application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Allocating the trace buffer failed and no reserve buffer was available to fall back to
    ///
    /// `BufferAllocationFailed(requested_bytes)`
    BufferAllocationFailed(usize),
    /// A handoff callback for a drained buffer returned `false`
    ///
    /// `HandoffFailed(thread_id)`
    HandoffFailed(usize),
    /// A misconfiguration of [`crate::options::TraceOptions`] was detected during validation
    ///
    /// `InvalidConfiguration(message)`
    InvalidConfiguration(String),
    /// A lifecycle operation (process/thread init or exit) failed
    ///
    /// `Lifecycle(message)`
    Lifecycle(String),
    /// Creating the unique offline output directory failed after exhausting all retries
    ///
    /// `OutputDirectoryExhausted(parent_dir, attempts)`
    OutputDirectoryExhausted(PathBuf, u32),
    /// Reserving scratch registers for inline instrumentation failed
    ///
    /// `ScratchRegisterUnavailable(basic_block_start_pc)`
    ScratchRegisterUnavailable(usize),
    /// A write to the pipe or the offline file wrote fewer bytes than requested
    ///
    /// `ShortWrite(destination, expected, actual)`
    ShortWrite(WriteDestination, usize, usize),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferAllocationFailed(bytes) => {
                write!(
                    f,
                    "Failed to allocate a {bytes}-byte trace buffer and no reserve buffer was \
                     available"
                )
            }
            Self::HandoffFailed(tid) => {
                write!(
                    f,
                    "Buffer handoff callback refused the drained buffer of thread {tid}"
                )
            }
            Self::InvalidConfiguration(message) => {
                write!(f, "Invalid trace configuration: {message}")
            }
            Self::Lifecycle(message) => write!(f, "Lifecycle error: {message}"),
            Self::OutputDirectoryExhausted(parent, attempts) => {
                write!(
                    f,
                    "Failed to create a unique output directory under '{}' after {attempts} \
                     attempts",
                    parent.display()
                )
            }
            Self::ScratchRegisterUnavailable(pc) => {
                write!(
                    f,
                    "No scratch register available to instrument the basic block at {pc:#x}"
                )
            }
            Self::ShortWrite(destination, expected, actual) => {
                write!(
                    f,
                    "Short write to {destination}: expected {expected} bytes, wrote {actual}"
                )
            }
        }
    }
}

impl std::error::Error for Error {}
