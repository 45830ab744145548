//! Per-thread trace buffer: allocation, the trailing redzone, and the OOM-continuation reserve
//!
//! Each worker thread owns exactly one live [`TraceBuffer`] at a time. The buffer is `trace_buf_size`
//! bytes of entries followed by `redzone_size` bytes of non-zero sentinel; inline code (modeled here
//! by [`crate::emitter`] writing directly into the buffer, since this crate has no JIT backend of
//! its own, see §9) advances a write offset into the entry region and the redzone's non-zero content
//! is what a loaded first-word check uses to detect "the buffer has data in it" at the end of every
//! basic block.

use log::{debug, warn};

use crate::entry::{Entry, ENTRY_SIZE};
use crate::error::Error;
use crate::host::BufferAllocator;

/// Size, in bytes, of the header slot reserved at the start of every buffer
///
/// Holds one [`Entry`]: either the thread-header template (offline, first buffer) or whatever
/// [`crate::drain`] overwrites it with on every subsequent drain.
pub const HEADER_SLOT_SIZE: usize = ENTRY_SIZE;

/// Default entry-region size of a thread's trace buffer; not part of the configuration surface
/// (§6 lists no knob for it), matched against the redzone once a block's worth of entries has
/// been written
pub const DEFAULT_TRACE_BUF_SIZE: usize = 64 * 1024;

/// Default redzone size; must comfortably exceed the largest run of entries a single basic block
/// can emit so the end-of-block check always has a chance to fire before real memory corruption
pub const DEFAULT_REDZONE_SIZE: usize = 4096;

/// Byte value the redzone is filled with; non-zero so inline code can test for it with a single
/// word compare
const SENTINEL_BYTE: u8 = 0xA5;

/// A thread's trace buffer: `trace_buf_size` bytes of entries, plus a trailing redzone
#[derive(Debug)]
pub struct TraceBuffer {
    bytes: Vec<u8>,
    trace_buf_size: usize,
    redzone_size: usize,
    /// Offset from the start of `bytes` the next entry will be written at; always within
    /// `[HEADER_SLOT_SIZE, trace_buf_size + redzone_size]`
    write_offset: usize,
}

impl TraceBuffer {
    /// Allocate a new buffer of `trace_buf_size + redzone_size` bytes through `allocator`,
    /// sentinel-fill the redzone, and rewind the write offset past the header slot
    pub fn allocate(
        allocator: &mut dyn BufferAllocator,
        trace_buf_size: usize,
        redzone_size: usize,
    ) -> Option<Self> {
        let max_buf_size = trace_buf_size + redzone_size;
        let mut bytes = allocator.allocate(max_buf_size)?;
        bytes[trace_buf_size..max_buf_size].fill(SENTINEL_BYTE);
        Some(Self {
            bytes,
            trace_buf_size,
            redzone_size,
            write_offset: HEADER_SLOT_SIZE,
        })
    }

    /// This buffer's entry-region capacity, excluding the redzone
    #[must_use]
    pub fn trace_buf_size(&self) -> usize {
        self.trace_buf_size
    }

    /// This buffer's total capacity, including the redzone
    #[must_use]
    pub fn max_buf_size(&self) -> usize {
        self.trace_buf_size + self.redzone_size
    }

    /// The current write offset, i.e. the simulated TLS buffer-pointer value relative to
    /// `buf_base`
    #[must_use]
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// True once the write offset has crossed into the redzone
    #[must_use]
    pub fn has_crossed_redzone(&self) -> bool {
        self.write_offset > self.trace_buf_size
    }

    /// True if nothing has been written since the buffer was created or last reset
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.write_offset == HEADER_SLOT_SIZE
    }

    /// Remaining entry-region bytes before the write offset reaches the redzone
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.trace_buf_size.saturating_sub(self.write_offset)
    }

    /// Append `entry` at the current write offset and advance it
    ///
    /// Permitted to write into the redzone itself (the last entry of a block may spill over it;
    /// that is precisely what the redzone check at the end of the block detects).
    pub fn push(&mut self, entry: &Entry) {
        if self.write_offset + ENTRY_SIZE > self.bytes.len() {
            // The host's real inline code would never reach this: the redzone check fires at the
            // end of every block, well before the buffer could overrun its backing allocation.
            // Kept as a hard stop rather than a silent truncation.
            self.bytes.resize(self.write_offset + ENTRY_SIZE, 0);
        }
        entry.write_into(&mut self.bytes[self.write_offset..]);
        self.write_offset += ENTRY_SIZE;
    }

    /// Overwrite the entry at byte offset 0 (the header slot) in place, without moving the write
    /// offset
    pub fn overwrite_header(&mut self, entry: &Entry) {
        entry.write_into(&mut self.bytes[..ENTRY_SIZE]);
    }

    /// Decode every entry in `[HEADER_SLOT_SIZE, write_offset)`, in order
    #[must_use]
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut pos = HEADER_SLOT_SIZE;
        while pos + ENTRY_SIZE <= self.write_offset {
            if let Some(entry) = Entry::read_from(&self.bytes[pos..]) {
                out.push(entry);
            }
            pos += ENTRY_SIZE;
        }
        out
    }

    /// Raw bytes from the header slot through the current write offset, the payload a drain
    /// writes out
    #[must_use]
    pub fn drained_payload(&self) -> &[u8] {
        &self.bytes[..self.write_offset]
    }

    /// Rewrite entry `index`'s address field in place (used by the physical-address rewrite)
    pub fn rewrite_entry_addr(&mut self, index: usize, addr: u64) {
        let pos = HEADER_SLOT_SIZE + index * ENTRY_SIZE;
        if let Some(mut entry) = Entry::read_from(&self.bytes[pos..]) {
            entry.set_addr(addr);
            entry.write_into(&mut self.bytes[pos..]);
        }
    }

    /// Zero the entry region, repaint the redzone sentinel over whatever the write offset had
    /// spilled into, and rewind the write offset past the header slot
    pub fn reset(&mut self) {
        let spill_end = self.write_offset.max(self.trace_buf_size);
        self.bytes[..self.trace_buf_size].fill(0);
        if spill_end > self.trace_buf_size {
            self.bytes[self.trace_buf_size..spill_end].fill(SENTINEL_BYTE);
        }
        self.write_offset = HEADER_SLOT_SIZE;
    }

    /// Every byte of the redzone, for the redzone-non-zero invariant check in tests
    #[must_use]
    #[cfg(test)]
    pub(crate) fn redzone_bytes(&self) -> &[u8] {
        &self.bytes[self.trace_buf_size..]
    }
}

/// One thread's cache-filter state: a direct-mapped array of line tags
#[derive(Debug, Clone)]
pub struct FilterCache {
    tags: Vec<Option<u64>>,
    line_size: u32,
}

impl FilterCache {
    /// Build a filter with `n_lines` direct-mapped slots, each covering `line_size` bytes
    #[must_use]
    pub fn new(n_lines: u32, line_size: u32) -> Self {
        Self {
            tags: vec![None; n_lines as usize],
            line_size,
        }
    }

    /// Look up `addr`; records a hit (returns `true`, no state change) or a miss (stores the new
    /// tag, returns `false`)
    pub fn probe(&mut self, addr: u64) -> bool {
        let tag = addr >> self.line_size.trailing_zeros();
        let idx = (tag as usize) & (self.tags.len() - 1);
        if self.tags[idx] == Some(tag) {
            return true;
        }
        self.tags[idx] = Some(tag);
        false
    }
}

/// One worker thread's exclusively-owned tracing state
///
/// Everything here is touched only by its owning thread, except the cross-thread handoff path
/// documented on [`crate::host::BufferHandoff`].
pub struct PerThreadState {
    /// The host-assigned thread ID this state belongs to
    pub tid: u32,
    /// The currently active buffer
    pub buf: TraceBuffer,
    /// A second buffer allocated lazily after the first is created, kept in reserve for the OOM
    /// continuation path
    pub reserve_buf: Option<TraceBuffer>,
    /// How many live buffers have been created so far (controls reserve allocation timing)
    pub num_buffers: u32,
    /// Running count of data entries seen across all drains of this thread
    pub num_refs: u64,
    /// Running count of bytes actually written out (suppressed writes past the size cap don't
    /// count)
    pub bytes_written: u64,
    /// Byte cap on `bytes_written`; `None` means unlimited. Lowered to `Some(bytes_written)` once
    /// the subsystem has fallen back to the reserve buffer, so no further output is attempted
    pub max_trace_size: Option<u64>,
    /// Size of the one-time header preceding the thread's very first buffer (offline mode only)
    pub init_header_size: usize,
    /// True once this thread has drained at least once
    pub has_drained: bool,
    /// Optional per-thread level-0 data cache filter
    pub l0_dcache: Option<FilterCache>,
    /// Optional per-thread level-0 instruction cache filter
    pub l0_icache: Option<FilterCache>,
}

impl PerThreadState {
    /// Create the first buffer for a freshly initialized thread
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferAllocationFailed`] if the primary allocation fails and there is no
    /// reserve to fall back to (there never is, on the very first buffer).
    pub fn new(
        tid: u32,
        allocator: &mut dyn BufferAllocator,
        trace_buf_size: usize,
        redzone_size: usize,
        init_header_size: usize,
        l0_dcache_lines: Option<u32>,
        l0_icache_lines: Option<u32>,
        line_size: u32,
    ) -> Result<Self, Error> {
        let buf = TraceBuffer::allocate(allocator, trace_buf_size, redzone_size)
            .ok_or(Error::BufferAllocationFailed(trace_buf_size + redzone_size))?;
        Ok(Self {
            tid,
            buf,
            reserve_buf: None,
            num_buffers: 1,
            num_refs: 0,
            bytes_written: 0,
            max_trace_size: None,
            init_header_size,
            has_drained: false,
            l0_dcache: l0_dcache_lines.map(|n| FilterCache::new(n, line_size)),
            l0_icache: l0_icache_lines.map(|n| FilterCache::new(n, line_size)),
        })
    }

    /// Create this thread's next buffer after a drain, per §4.4's `create_buffer`
    ///
    /// On the second call a reserve is allocated alongside. If the primary allocation fails: with
    /// a reserve available, switch to it and cap `max_trace_size` so no further output is
    /// attempted; with none available, the condition is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferAllocationFailed`] when the primary allocation fails and no reserve
    /// exists to fall back to.
    pub fn create_buffer(
        &mut self,
        allocator: &mut dyn BufferAllocator,
        trace_buf_size: usize,
        redzone_size: usize,
    ) -> Result<(), Error> {
        self.num_buffers += 1;
        if self.num_buffers == 2 {
            self.reserve_buf = TraceBuffer::allocate(allocator, trace_buf_size, redzone_size);
            debug!(
                "thread {}: reserve buffer {}",
                self.tid,
                if self.reserve_buf.is_some() {
                    "allocated"
                } else {
                    "unavailable"
                }
            );
        }

        match TraceBuffer::allocate(allocator, trace_buf_size, redzone_size) {
            Some(fresh) => {
                self.buf = fresh;
                Ok(())
            }
            None => {
                let Some(reserve) = self.reserve_buf.take() else {
                    return Err(Error::BufferAllocationFailed(trace_buf_size + redzone_size));
                };
                warn!(
                    "thread {}: primary buffer allocation failed, switching to reserve and \
                     suppressing further output",
                    self.tid
                );
                self.max_trace_size = Some(self.bytes_written);
                self.buf = reserve;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::host::HeapAllocator;

    fn alloc() -> HeapAllocator {
        HeapAllocator
    }

    #[test]
    fn test_allocate_fills_redzone_with_sentinel() {
        let mut allocator = alloc();
        let buf = TraceBuffer::allocate(&mut allocator, 256, 16).unwrap();
        assert!(buf.redzone_bytes().iter().all(|&b| b == SENTINEL_BYTE));
    }

    #[test]
    fn test_is_empty_initially() {
        let mut allocator = alloc();
        let buf = TraceBuffer::allocate(&mut allocator, 256, 16).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.write_offset(), HEADER_SLOT_SIZE);
    }

    #[test]
    fn test_push_advances_offset_and_crosses_redzone() {
        let mut allocator = alloc();
        let mut buf = TraceBuffer::allocate(&mut allocator, ENTRY_SIZE, 16).unwrap();
        assert!(!buf.has_crossed_redzone());
        buf.push(&Entry::thread_header(1));
        assert!(buf.has_crossed_redzone());
    }

    /// Invariant: after reset the entry region is zero and the write offset rewinds
    #[test]
    fn test_reset_zeroes_entry_region_and_rewinds() {
        let mut allocator = alloc();
        let mut buf = TraceBuffer::allocate(&mut allocator, ENTRY_SIZE * 2, 16).unwrap();
        buf.push(&Entry::thread_header(1));
        buf.reset();
        assert_eq!(buf.write_offset(), HEADER_SLOT_SIZE);
        assert!(buf.drained_payload()[HEADER_SLOT_SIZE..]
            .iter()
            .all(|&b| b == 0));
        assert!(buf.redzone_bytes().iter().all(|&b| b == SENTINEL_BYTE));
    }

    #[test]
    fn test_entries_decodes_in_order() {
        let mut allocator = alloc();
        let mut buf = TraceBuffer::allocate(&mut allocator, ENTRY_SIZE * 4, 16).unwrap();
        buf.push(&Entry::new(crate::entry::EntryKind::DataRead, 0x10, 0));
        buf.push(&Entry::new(crate::entry::EntryKind::DataWrite, 0x20, 0));
        let entries = buf.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].addr(), 0x10);
        assert_eq!(entries[1].addr(), 0x20);
    }

    /// S5: primary allocation fails after a reserve exists, subsystem falls back and caps further
    /// output
    #[test]
    fn test_create_buffer_falls_back_to_reserve_on_oom() {
        struct FlakyAllocator {
            calls: u32,
        }
        impl BufferAllocator for FlakyAllocator {
            fn allocate(&mut self, len: usize) -> Option<Vec<u8>> {
                self.calls += 1;
                // Fail the third allocation (the second `create_buffer` primary attempt).
                if self.calls == 3 {
                    None
                } else {
                    Some(vec![0u8; len])
                }
            }
        }
        let mut allocator = FlakyAllocator { calls: 0 };
        let mut state =
            PerThreadState::new(1, &mut allocator, 256, 16, 0, None, None, 64).unwrap();
        state.bytes_written = 512;
        state.create_buffer(&mut allocator, 256, 16).unwrap();
        assert_eq!(state.max_trace_size, Some(512));
    }

    #[test]
    fn test_create_buffer_fatal_without_reserve() {
        struct AlwaysFailsSecond {
            calls: u32,
        }
        impl BufferAllocator for AlwaysFailsSecond {
            fn allocate(&mut self, len: usize) -> Option<Vec<u8>> {
                self.calls += 1;
                if self.calls == 1 {
                    Some(vec![0u8; len])
                } else {
                    None
                }
            }
        }
        let mut allocator = AlwaysFailsSecond { calls: 0 };
        let mut state =
            PerThreadState::new(1, &mut allocator, 256, 16, 0, None, None, 64).unwrap();
        assert!(state.create_buffer(&mut allocator, 256, 16).is_err());
    }

    #[test]
    fn test_filter_cache_hit_then_miss_on_evict() {
        let mut cache = FilterCache::new(4, 64);
        assert!(!cache.probe(0x1000));
        assert!(cache.probe(0x1000));
        // Same index (tag & 3), different tag -> evicts the line.
        assert!(!cache.probe(0x1000 + 4 * 64));
        assert!(!cache.probe(0x1000));
    }
}
