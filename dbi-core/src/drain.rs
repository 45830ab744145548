//! Drain & framing: converts a thread's buffer to bytes and transports it offline or online
//!
//! §4.6 end to end: rewrite the header slot, decide whether the size cap suppresses the write,
//! walk the buffer's data entries (counting them and optionally rewriting their address to a
//! physical one), then either split the payload across atomic pipe writes (online) or hand the
//! buffer off or write it synchronously (offline). Every `Err` this module returns is one of the
//! error taxonomy's fatal conditions (§7); nothing here ever panics.

use log::{trace, warn};

use crate::buffer::PerThreadState;
use crate::entry::{Entry, EntryKind, ENTRY_SIZE};
use crate::error::{Error, WriteDestination};
use crate::host::{AddressTranslator, BufferAllocator, BufferHandoff, Transport};
use crate::options::TraceOptions;

/// Where a drained buffer's bytes go
pub enum DrainSink<'a> {
    /// Stream over the named pipe, splitting at `atomic_write_size` boundaries
    Online(&'a mut dyn Transport),
    /// Write to (or hand off) the per-thread offline file
    Offline(OfflineAction<'a>),
}

/// The offline drain path's two options: a synchronous write, or handing buffer ownership to a
/// callback and allocating a fresh buffer to keep tracing
pub enum OfflineAction<'a> {
    /// Write the drained bytes synchronously
    Write(&'a mut dyn std::io::Write),
    /// Hand the drained bytes to `callback`; on acceptance, `allocator` builds the thread's next
    /// buffer
    Handoff {
        /// Accepts or refuses ownership of the drained bytes
        callback: &'a mut dyn BufferHandoff,
        /// Builds the replacement buffer after a successful handoff
        allocator: &'a mut dyn BufferAllocator,
    },
}

/// Drain `state`'s active buffer per §4.6
///
/// No-op if the buffer is empty. `bypass_size_cap` is set by thread-exit draining, which must
/// always write out a footer regardless of whether the size cap has been reached.
///
/// # Errors
///
/// Returns [`Error::ShortWrite`] if a pipe or file write completes fewer bytes than given, or
/// [`Error::HandoffFailed`] if an offline handoff callback refuses the buffer, or
/// [`Error::BufferAllocationFailed`] if handoff acceptance's follow-up buffer allocation fails with
/// no reserve to fall back to — each is this module's only fatal-abort surface (§7).
pub fn drain(
    state: &mut PerThreadState,
    options: &TraceOptions,
    translator: Option<&dyn AddressTranslator>,
    sink: DrainSink<'_>,
    bypass_size_cap: bool,
) -> Result<(), Error> {
    if state.buf.is_empty() {
        return Ok(());
    }

    let is_first_offline_drain = matches!(&sink, DrainSink::Offline(_)) && !state.has_drained;
    if !is_first_offline_drain {
        state.buf.overwrite_header(&Entry::thread_header(state.tid));
    }

    let entries = state.buf.entries();
    for (idx, entry) in entries.iter().enumerate() {
        if !entry.kind().is_data_ref() {
            continue;
        }
        state.num_refs += 1;
        if options.use_physical {
            let Some(translator) = translator else {
                continue;
            };
            let phys = translator.virtual_to_physical(entry.addr());
            if phys == 0 {
                warn!(
                    "drain: thread {}: virtual address {:#x} has no physical mapping, leaving \
                     virtual",
                    state.tid,
                    entry.addr()
                );
            } else {
                state.buf.rewrite_entry_addr(idx, phys);
            }
        }
    }

    let payload_len = state.buf.drained_payload().len() as u64;
    let suppressed = !bypass_size_cap
        && state
            .max_trace_size
            .is_some_and(|cap| state.bytes_written + payload_len > cap);
    if suppressed {
        trace!(
            "drain: thread {}: size cap reached, suppressing {payload_len}-byte write",
            state.tid
        );
    }

    let mut handed_off = false;
    if !suppressed {
        match sink {
            DrainSink::Online(pipe) => write_online(state, pipe, &entries)?,
            DrainSink::Offline(OfflineAction::Write(writer)) => {
                write_offline(state, writer, payload_len)?;
            }
            DrainSink::Offline(OfflineAction::Handoff { callback, allocator }) => {
                let payload = state.buf.drained_payload().to_vec();
                if !callback.handoff(state.tid, payload) {
                    return Err(Error::HandoffFailed(state.tid as usize));
                }
                state.bytes_written += payload_len;
                let trace_buf_size = state.buf.trace_buf_size();
                let redzone_size = state.buf.max_buf_size() - trace_buf_size;
                state.create_buffer(allocator, trace_buf_size, redzone_size)?;
                handed_off = true;
            }
        }
    }

    state.has_drained = true;
    if !handed_off {
        state.buf.reset();
    }
    Ok(())
}

fn write_offline(
    state: &mut PerThreadState,
    writer: &mut dyn std::io::Write,
    payload_len: u64,
) -> Result<(), Error> {
    let payload = state.buf.drained_payload().to_vec();
    let written = writer
        .write(&payload)
        .map_err(|_| Error::ShortWrite(WriteDestination::File, payload.len(), 0))?;
    if written < payload.len() {
        return Err(Error::ShortWrite(WriteDestination::File, payload.len(), written));
    }
    state.bytes_written += payload_len;
    Ok(())
}

/// Split the payload into pipe writes no larger than `Transport::atomic_write_size`, splitting
/// only immediately before an `INSTR`/`INSTR_BUNDLE` entry so a data entry never separates from
/// its instruction, and re-prefixing every chunk after the first with the thread header
fn write_online(
    state: &mut PerThreadState,
    pipe: &mut dyn Transport,
    entries: &[Entry],
) -> Result<(), Error> {
    let atomic_write_size = pipe.atomic_write_size();
    let mut header_bytes = [0u8; ENTRY_SIZE];
    Entry::thread_header(state.tid).write_into(&mut header_bytes);

    let split_points = split_points(entries);
    let mut bytes_sent = 0u64;

    let mut chunk = header_bytes.to_vec();
    for (i, &start) in split_points.iter().enumerate() {
        let end = split_points.get(i + 1).copied().unwrap_or(entries.len());
        let mut group_bytes = Vec::with_capacity((end - start) * ENTRY_SIZE);
        for entry in &entries[start..end] {
            let mut buf = [0u8; ENTRY_SIZE];
            entry.write_into(&mut buf);
            group_bytes.extend_from_slice(&buf);
        }
        if chunk.len() > header_bytes.len() && chunk.len() + group_bytes.len() > atomic_write_size {
            bytes_sent += send_chunk(pipe, &chunk)?;
            chunk = header_bytes.to_vec();
        }
        chunk.extend(group_bytes);
    }
    if chunk.len() > header_bytes.len() {
        bytes_sent += send_chunk(pipe, &chunk)?;
    }

    state.bytes_written += bytes_sent;
    Ok(())
}

/// Indices into `entries` where a new online chunk may start: always `0`, and every index whose
/// entry is an `INSTR`/`INSTR_BUNDLE` (data entries must stay attached to the instruction that
/// produced them)
fn split_points(entries: &[Entry]) -> Vec<usize> {
    let mut points = vec![0];
    for (idx, entry) in entries.iter().enumerate().skip(1) {
        if matches!(entry.kind(), EntryKind::Instr | EntryKind::InstrBundle) {
            points.push(idx);
        }
    }
    points
}

fn send_chunk(pipe: &mut dyn Transport, chunk: &[u8]) -> Result<u64, Error> {
    let written = pipe
        .write_chunk(chunk)
        .map_err(|_| Error::ShortWrite(WriteDestination::Pipe, chunk.len(), 0))?;
    if written < chunk.len() {
        return Err(Error::ShortWrite(WriteDestination::Pipe, chunk.len(), written));
    }
    Ok(written as u64)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::host::HeapAllocator;
    use crate::testutil::{FakeAddressTranslator, FakeBufferHandoff, FakeTransport};

    fn state_with_entries(n: usize) -> PerThreadState {
        let mut allocator = HeapAllocator;
        let mut state = PerThreadState::new(
            7,
            &mut allocator,
            ENTRY_SIZE * (n + 1),
            64,
            0,
            None,
            None,
            64,
        )
        .unwrap();
        // Simulates the thread-header lifecycle writes into the header slot before the buffer is
        // ever drained.
        state.buf.overwrite_header(&Entry::thread_header(state.tid));
        for i in 0..n {
            state
                .buf
                .push(&Entry::new(EntryKind::DataRead, 0x1000 + i as u64, 0));
        }
        state
    }

    /// S4: drain with filter off, offline: one header followed by N entries
    #[test]
    fn test_offline_drain_writes_header_then_entries() {
        let mut state = state_with_entries(4096);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut out = Vec::new();
        drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Write(&mut out)),
            false,
        )
        .unwrap();

        assert_eq!(out.len(), ENTRY_SIZE * 4097);
        let header = Entry::read_from(&out).unwrap();
        assert_eq!(header.kind(), EntryKind::Thread);
        assert_eq!(header.aux(), 7);
        assert_eq!(state.bytes_written, (ENTRY_SIZE * 4097) as u64);
        assert_eq!(state.num_refs, 4096);
    }

    /// Drain rewind (property 5): after a drain without handoff the buffer is empty and zeroed
    #[test]
    fn test_drain_rewinds_buffer() {
        let mut state = state_with_entries(10);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut out = Vec::new();
        drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Write(&mut out)),
            false,
        )
        .unwrap();

        assert!(state.buf.is_empty());
    }

    #[test]
    fn test_drain_on_empty_buffer_is_noop() {
        let mut allocator = HeapAllocator;
        let mut state = PerThreadState::new(1, &mut allocator, 256, 16, 0, None, None, 64).unwrap();
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut out = Vec::new();
        drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Write(&mut out)),
            false,
        )
        .unwrap();
        assert!(out.is_empty());
    }

    /// Property 8: physical rewrite applies the mapping when nonzero, else leaves virtual
    #[test]
    fn test_physical_rewrite_applies_when_mapped() {
        let mut state = state_with_entries(2);
        let mut opts = TraceOptions::parse_from(["dbi-core"]);
        opts.use_physical = true;
        let mut translator = FakeAddressTranslator::new();
        translator.map(0x1000, 0x9000);
        // 0x1001 left unmapped on purpose.
        let mut out = Vec::new();
        drain(
            &mut state,
            &opts,
            Some(&translator),
            DrainSink::Offline(OfflineAction::Write(&mut out)),
            false,
        )
        .unwrap();

        let first = Entry::read_from(&out[ENTRY_SIZE..]).unwrap();
        let second = Entry::read_from(&out[ENTRY_SIZE * 2..]).unwrap();
        assert_eq!(first.addr(), 0x9000);
        assert_eq!(second.addr(), 0x1001);
    }

    /// Property 6: every pipe write stays within the transport's atomic-write size
    #[test]
    fn test_online_drain_splits_within_atomic_write_size() {
        let mut state = state_with_entries(0);
        for i in 0..20 {
            state.buf.push(&Entry::new(EntryKind::Instr, 0x1000 + i, 0));
            state.buf.push(&Entry::new(EntryKind::DataRead, 0x2000 + i, 0));
        }
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut transport = FakeTransport::new(ENTRY_SIZE * 4);
        drain(&mut state, &opts, None, DrainSink::Online(&mut transport), false).unwrap();

        assert!(transport.chunks.iter().all(|c| c.len() <= ENTRY_SIZE * 4));
        assert!(transport.chunks.len() > 1);
    }

    /// Property 7: every chunk begins with a thread-header entry tagging the emitting thread
    #[test]
    fn test_online_drain_prefixes_every_chunk_with_thread_header() {
        let mut state = state_with_entries(0);
        state.tid = 42;
        for i in 0..20 {
            state.buf.push(&Entry::new(EntryKind::Instr, 0x1000 + i, 0));
            state.buf.push(&Entry::new(EntryKind::DataRead, 0x2000 + i, 0));
        }
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut transport = FakeTransport::new(ENTRY_SIZE * 4);
        drain(&mut state, &opts, None, DrainSink::Online(&mut transport), false).unwrap();

        for chunk in &transport.chunks {
            let header = Entry::read_from(chunk).unwrap();
            assert_eq!(header.kind(), EntryKind::Thread);
            assert_eq!(header.aux(), 42);
        }
    }

    #[test]
    fn test_short_pipe_write_is_fatal() {
        let mut state = state_with_entries(1);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut transport = FakeTransport::new(4096);
        transport.force_short_write = true;
        let err = drain(&mut state, &opts, None, DrainSink::Online(&mut transport), false).unwrap_err();
        assert!(matches!(err, Error::ShortWrite(WriteDestination::Pipe, _, _)));
    }

    #[test]
    fn test_size_cap_suppresses_write_but_keeps_counting() {
        let mut state = state_with_entries(10);
        state.max_trace_size = Some(1);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut out = Vec::new();
        drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Write(&mut out)),
            false,
        )
        .unwrap();

        assert!(out.is_empty());
        assert_eq!(state.num_refs, 10);
        assert_eq!(state.bytes_written, 0);
    }

    #[test]
    fn test_bypass_size_cap_forces_write() {
        let mut state = state_with_entries(10);
        state.max_trace_size = Some(1);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut out = Vec::new();
        drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Write(&mut out)),
            true,
        )
        .unwrap();

        assert!(!out.is_empty());
    }

    #[test]
    fn test_handoff_refusal_is_fatal() {
        let mut state = state_with_entries(1);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut handoff = FakeBufferHandoff {
            refuse_next: true,
            ..Default::default()
        };
        let mut allocator = HeapAllocator;
        let err = drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Handoff {
                callback: &mut handoff,
                allocator: &mut allocator,
            }),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::HandoffFailed(_)));
    }

    #[test]
    fn test_successful_handoff_allocates_a_fresh_buffer() {
        let mut state = state_with_entries(1);
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let mut handoff = FakeBufferHandoff::default();
        let mut allocator = HeapAllocator;
        drain(
            &mut state,
            &opts,
            None,
            DrainSink::Offline(OfflineAction::Handoff {
                callback: &mut handoff,
                allocator: &mut allocator,
            }),
            false,
        )
        .unwrap();

        assert_eq!(handoff.accepted.len(), 1);
        assert!(state.buf.is_empty());
    }
}
