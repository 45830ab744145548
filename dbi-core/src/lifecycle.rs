//! Process, thread, and fork lifecycle
//!
//! §4.7 end to end. This crate does not model "register code-cache events" or "free TLS" as
//! stateful operations of its own: those are pure host-runtime bookkeeping the collaborator
//! traits in [`crate::host`] already abstract away (the host decides when to call
//! [`crate::emitter::Emitter::instrument_block`]; there is no separate registration call on this
//! side of the boundary). What lives here is everything this crate itself owns: the output
//! directory and per-thread files or pipe, the handler registry, the global ref counter, and the
//! per-thread trace state.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use log::debug;

use crate::buffer::{PerThreadState, DEFAULT_REDZONE_SIZE, DEFAULT_TRACE_BUF_SIZE};
use crate::drain::{drain, DrainSink, OfflineAction};
use crate::entry::{Entry, EntryKind, ENTRY_SIZE};
use crate::error::{Error, WriteDestination};
use crate::host::{AddressTranslator, BufferAllocator, TlsSlot, TlsSlots, Transport};
use crate::options::TraceOptions;
use crate::registry::HandlerRegistry;

/// Highest number of suffixed attempts [`process_init`] makes before giving up on a unique output
/// directory
const MAX_OUTDIR_ATTEMPTS: u32 = 10_000;

/// The instrumentation strategy: exactly one of an offline output directory or an online pipe
///
/// A tagged variant rather than the placement-constructed object the reference design builds in
/// a fixed-size slot; no placement is needed once the two shapes are just an enum (see the design
/// notes this resolves).
pub enum Strategy {
    /// Stream drained buffers over a host-opened named pipe
    Online {
        /// The pipe; `Mutex`-guarded since every worker thread's drain shares it
        transport: Mutex<Box<dyn Transport>>,
    },
    /// Write one file per thread under a process-unique output directory
    Offline {
        /// The unique directory created for this process
        dir: PathBuf,
        /// The open module-list file
        modules_log: Mutex<File>,
    },
}

/// Everything owned process-wide: the handler registry, the active strategy, frozen
/// configuration, and the global ref counter
///
/// Created once at process init and shared (typically behind an `Arc`) with every worker thread.
pub struct ProcessContext {
    /// Annotation and Valgrind handler registry
    pub registry: HandlerRegistry,
    /// Frozen configuration, read but never mutated after init
    pub options: TraceOptions,
    /// The active output strategy
    pub strategy: Strategy,
    /// Running total of `num_refs` contributed by every thread that has exited so far
    pub global_num_refs: Mutex<u64>,
    /// The raw TLS slot generated code uses to reach the active buffer pointer
    pub tls_buf_ptr: TlsSlot,
    /// The raw TLS slot holding the data-cache filter array pointer, if filtering is enabled
    pub tls_dcache: Option<TlsSlot>,
    /// The raw TLS slot holding the instruction-cache filter array pointer, if filtering is
    /// enabled
    pub tls_icache: Option<TlsSlot>,
}

/// One thread's lifecycle state: its trace state plus its offline file, if any
pub struct ThreadContext {
    /// This thread's trace buffers, counters, and filters
    pub state: PerThreadState,
    /// The thread's offline trace file; `None` in online mode
    pub file: Option<File>,
}

/// Create `<parent>/<appid>.<pid>.dir`, or `<parent>/<appid>.<pid>-<n>.dir` for the first `n` that
/// does not already exist, trying at most [`MAX_OUTDIR_ATTEMPTS`] names
///
/// # Errors
///
/// Returns [`Error::OutputDirectoryExhausted`] if every attempt collides, and
/// [`Error::Lifecycle`] if directory creation fails for any reason other than a name collision.
fn create_unique_outdir(parent: &Path, appid: &str, pid: u32) -> Result<PathBuf, Error> {
    for attempt in 0..MAX_OUTDIR_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{appid}.{pid}.dir")
        } else {
            format!("{appid}.{pid}-{attempt}.dir")
        };
        let path = parent.join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(Error::Lifecycle(format!(
                    "failed to create output directory {}: {err}",
                    path.display()
                )));
            }
        }
    }
    Err(Error::OutputDirectoryExhausted(
        parent.to_path_buf(),
        MAX_OUTDIR_ATTEMPTS,
    ))
}

/// Build the one-time thread/TID/PID header written once, at thread init, ahead of a thread's
/// first buffer
fn init_header_bytes(tid: u32, pid: u32) -> [u8; ENTRY_SIZE * 2] {
    let mut bytes = [0u8; ENTRY_SIZE * 2];
    Entry::new(EntryKind::Thread, 0, tid).write_into(&mut bytes[..ENTRY_SIZE]);
    Entry::new(EntryKind::Pid, 0, pid).write_into(&mut bytes[ENTRY_SIZE..]);
    bytes
}

/// Process init: validate configuration, stand up the output strategy, and allocate the raw TLS
/// slots generated code needs
///
/// # Errors
///
/// Returns an error if configuration validation fails, the offline output directory cannot be
/// created (all [`MAX_OUTDIR_ATTEMPTS`] names collide, or creation fails outright), or the
/// module-list file cannot be opened. Online mode takes an already-opened `transport` (opening
/// and sizing the named pipe is host-runtime plumbing, out of scope here).
pub fn process_init(
    options: TraceOptions,
    appid: &str,
    pid: u32,
    tls: &mut dyn TlsSlots,
    online_transport: Option<Box<dyn Transport>>,
) -> anyhow::Result<ProcessContext> {
    options.validate()?;

    let strategy = if options.offline {
        let parent = PathBuf::from(&options.outdir);
        let dir = create_unique_outdir(&parent, appid, pid)?;
        let modules_log = File::create(dir.join("modules.log"))
            .with_context(|| format!("failed to create modules.log under {}", dir.display()))?;
        debug!("process init: offline output directory {}", dir.display());
        Strategy::Offline {
            dir,
            modules_log: Mutex::new(modules_log),
        }
    } else {
        let transport = online_transport
            .ok_or_else(|| Error::Lifecycle("online mode requires an opened transport".to_owned()))?;
        debug!("process init: online mode, ipc name '{}'", options.ipc_name);
        Strategy::Online {
            transport: Mutex::new(transport),
        }
    };

    let tls_buf_ptr = tls.alloc_raw_slot();
    let tls_dcache = options.l0_filter.then(|| tls.alloc_raw_slot());
    let tls_icache = options.l0_filter.then(|| tls.alloc_raw_slot());

    Ok(ProcessContext {
        registry: HandlerRegistry::new(),
        options,
        strategy,
        global_num_refs: Mutex::new(0),
        tls_buf_ptr,
        tls_dcache,
        tls_icache,
    })
}

/// Thread init: allocate per-thread state, create the first buffer, and write the one-time
/// thread/TID/PID header ahead of it
///
/// # Errors
///
/// Returns an error if the per-thread offline file cannot be created, the header write short-
/// writes, or the first buffer allocation fails (always fatal — there is never a reserve on the
/// first buffer).
pub fn thread_init(
    ctx: &ProcessContext,
    tid: u32,
    pid: u32,
    appid: &str,
    allocator: &mut dyn BufferAllocator,
    tls: &mut dyn TlsSlots,
) -> anyhow::Result<ThreadContext> {
    let header = init_header_bytes(tid, pid);

    let file = match &ctx.strategy {
        Strategy::Offline { dir, .. } => {
            let path = dir.join(format!("{appid}.{tid}.trace"));
            let mut file = File::create(&path)
                .with_context(|| format!("failed to create per-thread trace file {}", path.display()))?;
            file.write_all(&header)
                .with_context(|| format!("failed to write thread header to {}", path.display()))?;
            Some(file)
        }
        Strategy::Online { transport } => {
            let mut guard = transport.lock().expect("transport lock poisoned");
            let written = guard
                .write_chunk(&header)
                .context("failed to write thread header to pipe")?;
            if written < header.len() {
                return Err(Error::ShortWrite(WriteDestination::Pipe, header.len(), written).into());
            }
            None
        }
    };

    let l0d_lines = ctx.options.l0_filter.then(|| ctx.options.l0d_lines());
    let l0i_lines = ctx.options.l0_filter.then(|| ctx.options.l0i_lines());
    if ctx.options.l0_filter {
        if let Some(slot) = ctx.tls_dcache {
            tls.set(slot, 1);
        }
        if let Some(slot) = ctx.tls_icache {
            tls.set(slot, 1);
        }
    }

    let mut state = PerThreadState::new(
        tid,
        allocator,
        DEFAULT_TRACE_BUF_SIZE,
        DEFAULT_REDZONE_SIZE,
        header.len(),
        l0d_lines,
        l0i_lines,
        ctx.options.line_size,
    )?;
    // The very first drain skips re-overwriting slot 0 (§4.6 step 2) on the assumption that a
    // thread header already occupies it; pre-populate it here so that assumption holds.
    state.buf.overwrite_header(&Entry::thread_header(tid));
    if ctx.options.max_trace_size > 0 {
        state.max_trace_size = Some(ctx.options.max_trace_size);
    }
    debug!("thread {tid}: initialized (pid {pid})");

    Ok(ThreadContext { state, file })
}

/// POSIX fork init: stand up a fresh process context and re-initialize the forking thread inside
/// it
///
/// Re-creating the process context rather than patching the old one gives `global_num_refs` a
/// fresh zero and a fresh output directory for free, matching "reset `num_refs`; re-create the
/// offline subdirectory" directly. Any online transport the host still has open across the fork
/// (files not marked close-on-fork survive it) is passed back in as `online_transport`.
///
/// # Errors
///
/// Same failure modes as [`process_init`] and [`thread_init`].
pub fn fork_init(
    options: TraceOptions,
    appid: &str,
    new_pid: u32,
    forking_tid: u32,
    allocator: &mut dyn BufferAllocator,
    tls: &mut dyn TlsSlots,
    online_transport: Option<Box<dyn Transport>>,
) -> anyhow::Result<(ProcessContext, ThreadContext)> {
    let ctx = process_init(options, appid, new_pid, tls, online_transport)?;
    let thread = thread_init(&ctx, forking_tid, new_pid, appid, allocator, tls)?;
    Ok((ctx, thread))
}

/// Thread exit: append a thread-exit footer, drain with the size cap bypassed, close the
/// per-thread file, and contribute this thread's `num_refs` to the global counter
///
/// If the size cap has actually been exceeded by what's currently buffered, any
/// buffered-but-suppressed entries are discarded first so the final drain writes only the footer,
/// per §4.7's "rewind so only a footer is written". A configured cap the thread never reached
/// leaves the buffer untouched, exactly mirroring [`crate::drain::drain`]'s own
/// `bytes_written + payload_len > cap` test — a thread that merely has a cap configured must not
/// lose legitimately buffered entries it was never going to suppress.
///
/// # Errors
///
/// Returns an error if the final drain fails (a short write or handoff refusal, per
/// [`crate::drain::drain`]).
pub fn thread_exit(
    ctx: &ProcessContext,
    thread: &mut ThreadContext,
    translator: Option<&dyn AddressTranslator>,
) -> anyhow::Result<()> {
    if let Some(cap) = thread.state.max_trace_size {
        let payload_len = thread.state.buf.drained_payload().len() as u64;
        if thread.state.bytes_written + payload_len > cap {
            thread.state.buf.reset();
        }
    }
    let tid = thread.state.tid;
    thread.state.buf.push(&Entry::thread_exit(tid));

    match &ctx.strategy {
        Strategy::Offline { .. } => {
            let file = thread
                .file
                .as_mut()
                .expect("offline thread context must carry a file");
            drain(
                &mut thread.state,
                &ctx.options,
                translator,
                DrainSink::Offline(OfflineAction::Write(file)),
                true,
            )?;
        }
        Strategy::Online { transport } => {
            let mut guard = transport.lock().expect("transport lock poisoned");
            drain(
                &mut thread.state,
                &ctx.options,
                translator,
                DrainSink::Online(&mut **guard),
                true,
            )?;
        }
    }

    if let Some(file) = thread.file.take() {
        drop(file);
    }

    let mut global = ctx.global_num_refs.lock().expect("num_refs lock poisoned");
    *global += thread.state.num_refs;
    debug!(
        "thread {tid}: exited, contributed {} refs (global total {global})",
        thread.state.num_refs
    );
    Ok(())
}

/// Process exit: invoke the user-provided exit callback with the final total ref count, then
/// drop the context (closing the module-list file or pipe)
///
/// Takes `ctx` by value: by the time a process is exiting, no other thread should still be
/// holding a reference to it.
pub fn process_exit(ctx: ProcessContext, exit_callback: Option<&mut dyn FnMut(u64)>) {
    let total_refs = *ctx.global_num_refs.lock().expect("num_refs lock poisoned");
    if let Some(callback) = exit_callback {
        callback(total_refs);
    }
    debug!("process exit: {total_refs} total refs recorded");
}
