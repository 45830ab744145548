//! Instrumentation emitter: the per-basic-block visitor that records memory references and
//! instruction fetches into a thread's trace buffer
//!
//! This crate has no JIT backend of its own (§1 puts "generated machine code" and "code-cache
//! insertion APIs" on the host side of the contract), so this module plays a dual role compared to
//! the reference design: it both decides what inline code *would* emit and, since there is nothing
//! else to execute that code, performs the equivalent buffer writes directly against
//! [`crate::buffer::PerThreadState`]. The policy sequence — duplicate/repstr skipping, exclusive-store
//! deferral, delay bundling, the level-0 filter, the predicated-reset/final-adjust steps (a no-op
//! once writes are eager, see [`Emitter::instrument_instruction`]), and the end-of-block redzone
//! check — follows §4.5 instruction by instruction; only the "inline vs. executed eagerly"
//! distinction is a simplification, called out here rather than left implicit.

use log::trace;

use crate::arch::{Arch, ScratchConstraint};
use crate::block::{BasicBlock, Instruction, InstructionKind, MemRef};
use crate::buffer::PerThreadState;
use crate::entry::{Entry, EntryKind};
use crate::error::Error;
use crate::host::{CleanCall, CleanCallSink, ScratchRegisters};
use crate::options::TraceOptions;

/// How many plain, memref-free instructions the delay buffer holds before it must be flushed as an
/// instruction bundle
pub const MAX_DELAY_INSTRS: usize = 8;

/// Per-basic-block scratch state threaded through instruction instrumentation
///
/// Freed at the end of `instrument_block` (the "post-instrument" callback in §4.5's four-callback
/// pipeline collapses to simply dropping this value, since nothing here is heap-allocated by the
/// host).
#[derive(Debug, Default)]
struct BlockUserData {
    /// Set when the app-to-app pass detected a repeated-string expansion in this block
    repstr: bool,
    /// Instructions queued for bundled emission
    delay_instrs: Vec<Instruction>,
    /// An exclusive store whose memref entry is deferred to the following instruction
    strex: Option<Instruction>,
    /// The PC of the last instruction an entry was actually emitted for, used by the icache
    /// filter's same-line short circuit
    last_app_pc: Option<u64>,
}

/// The per-basic-block instrumentation visitor
pub struct Emitter<'o> {
    arch: Arch,
    options: &'o TraceOptions,
}

impl<'o> Emitter<'o> {
    /// Build an emitter for `arch`, reading its behavior-affecting knobs from `options`
    #[must_use]
    pub fn new(arch: Arch, options: &'o TraceOptions) -> Self {
        Self { arch, options }
    }

    /// Detect whether `block` already contains the same-PC duplicates a repeated-string expansion
    /// leaves behind
    ///
    /// Stands in for the app-to-app callback's real job (rewriting a string-loop instruction into
    /// explicit iteration), which requires the host's instruction encoder and is out of scope here;
    /// this crate only needs to know the resulting flag.
    fn detect_repstr(block: &BasicBlock) -> bool {
        block
            .instructions()
            .windows(2)
            .any(|pair| pair[0].pc == pair[1].pc)
    }

    /// Instrument every application instruction in `block`, writing entries into `state`'s active
    /// buffer and invoking `on_redzone_cross` if the buffer crosses into its redzone by the end of
    /// the block
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScratchRegisterUnavailable`] if the host's scratch-register reservation
    /// fails; this is the code-cache path's one fatal condition per §7, surfaced here rather than
    /// silently degraded since instrumentation cannot proceed without scratch state.
    pub fn instrument_block(
        &self,
        block: &BasicBlock,
        state: &mut PerThreadState,
        scratch: &mut dyn ScratchRegisters,
        clean_calls: &mut dyn CleanCallSink,
        mut on_redzone_cross: impl FnMut(&mut PerThreadState) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let block_pc = block.instructions().first().map_or(0, |i| i.pc);

        let first = scratch
            .reserve(self.arch.first_scratch_constraint())
            .ok_or(Error::ScratchRegisterUnavailable(block_pc as usize))?;
        let second = match scratch.reserve(ScratchConstraint::LowRegister) {
            Some(reg) => reg,
            None => {
                scratch.release(first);
                return Err(Error::ScratchRegisterUnavailable(block_pc as usize));
            }
        };
        let third = if self.options.l0_filter {
            match scratch.reserve(ScratchConstraint::LowRegister) {
                Some(reg) => Some(reg),
                None => {
                    scratch.release(first);
                    scratch.release(second);
                    return Err(Error::ScratchRegisterUnavailable(block_pc as usize));
                }
            }
        } else {
            None
        };

        let mut ud = BlockUserData {
            repstr: Self::detect_repstr(block),
            ..Default::default()
        };
        let instructions = block.instructions();
        let mut previous_pc: Option<u64> = None;

        for (idx, instr) in instructions.iter().enumerate() {
            let is_last = idx == instructions.len() - 1;
            self.instrument_instruction(instr, idx, is_last, &mut ud, state, &mut previous_pc);
        }

        if let Some(reg) = third {
            scratch.release(reg);
        }
        scratch.release(second);
        scratch.release(first);

        if state.buf.has_crossed_redzone() {
            clean_calls.insert_clean_call(instructions.len().saturating_sub(1), CleanCall::Drain);
            trace!("block at {block_pc:#x}: redzone crossed, invoking drain");
            on_redzone_cross(state)?;
        }

        Ok(())
    }

    /// §4.5's "predicated reset" and "final adjust" steps exist to keep a pending, not-yet-
    /// committed buffer-pointer advance consistent across a conditionally-executed instruction's
    /// inline sequence: real inline code accumulates the advance in a register before committing
    /// it to the TLS pointer, so a predicate that turns out false must still leave that pointer
    /// correct. Since this crate writes each entry straight into the buffer (see the module doc's
    /// inline-vs-eager note) there is no uncommitted advance to flush or gate on a predicate —
    /// every write is already final the instant it happens. `Instruction::is_conditional` is kept
    /// on the data model for host parity, but carries no branching here: a predicated instruction's
    /// entries are emitted the same as an unconditional one's, a further instance of the same
    /// simplification (real inline code would skip them if the predicate were false at runtime,
    /// which this crate has no execution state to observe).
    fn instrument_instruction(
        &self,
        instr: &Instruction,
        idx: usize,
        is_last: bool,
        ud: &mut BlockUserData,
        state: &mut PerThreadState,
        previous_pc: &mut Option<u64>,
    ) {
        if idx != 0 && *previous_pc == Some(instr.pc) && ud.repstr {
            return;
        }

        if instr.is_exclusive_store() && !instr.exclusive_store_writes_own_base() {
            ud.strex = Some(instr.clone());
            *previous_pc = Some(instr.pc);
            return;
        }

        let bundleable = instr.has_no_memory_refs()
            && !is_last
            && ud.strex.is_none()
            && !self.options.l0_filter
            && ud.delay_instrs.len() < MAX_DELAY_INSTRS
            && !matches!(instr.kind, InstructionKind::AnnotationMarker { .. });
        if bundleable {
            ud.delay_instrs.push(instr.clone());
            *previous_pc = Some(instr.pc);
            return;
        }

        self.flush_delay_bundle(ud, state);
        if let Some(strex) = ud.strex.take() {
            self.emit_strex(&strex, state, ud);
        }

        if !instr.memory_refs().is_empty() || !ud.repstr {
            self.emit_instr_entry(instr, state, ud);
        }
        for mem in instr.memory_refs() {
            self.emit_memref(*mem, state, ud);
        }

        ud.last_app_pc = Some(instr.pc);
        *previous_pc = Some(instr.pc);
    }

    /// Flush `ud.delay_instrs` as one full instr entry for the first instruction followed by an
    /// instruction-bundle entry for the rest — unless physical translation is enabled, since a
    /// bundle may cross a page boundary and a single translated address could not stand for it
    fn flush_delay_bundle(&self, ud: &mut BlockUserData, state: &mut PerThreadState) {
        let delayed = std::mem::take(&mut ud.delay_instrs);
        if delayed.is_empty() {
            return;
        }
        if self.options.use_physical {
            for instr in &delayed {
                self.emit_instr_entry(instr, state, ud);
            }
            return;
        }
        self.emit_instr_entry(&delayed[0], state, ud);
        if delayed.len() > 1 {
            let bundle_pc = delayed[1].pc;
            let count = u32::try_from(delayed.len() - 1).unwrap_or(u32::MAX);
            self.push_entry(state, Entry::new(EntryKind::InstrBundle, bundle_pc, count), ud, false);
        }
    }

    fn emit_strex(&self, strex: &Instruction, state: &mut PerThreadState, ud: &mut BlockUserData) {
        self.emit_instr_entry(strex, state, ud);
        if let InstructionKind::ExclusiveStore { mem, .. } = &strex.kind {
            self.push_entry(state, Entry::new(EntryKind::DataWrite, mem.addr, 0), ud, true);
        }
    }

    fn emit_instr_entry(&self, instr: &Instruction, state: &mut PerThreadState, ud: &mut BlockUserData) {
        self.push_entry(state, Entry::new(EntryKind::Instr, instr.pc, 0), ud, false);
    }

    fn emit_memref(&self, mem: MemRef, state: &mut PerThreadState, ud: &mut BlockUserData) {
        let kind = if mem.is_write {
            EntryKind::DataWrite
        } else {
            EntryKind::DataRead
        };
        self.push_entry(state, Entry::new(kind, mem.addr, 0), ud, true);
    }

    /// Write `entry` into the buffer, unless the level-0 filter reports a hit for its address
    fn push_entry(&self, state: &mut PerThreadState, entry: Entry, ud: &mut BlockUserData, is_data: bool) {
        if self.options.l0_filter && self.filtered(state, &entry, ud, is_data) {
            return;
        }
        state.buf.push(&entry);
    }

    fn filtered(&self, state: &mut PerThreadState, entry: &Entry, ud: &BlockUserData, is_data: bool) -> bool {
        if is_data {
            return state
                .l0_dcache
                .as_mut()
                .is_some_and(|cache| cache.probe(entry.addr()));
        }
        let same_line = ud.last_app_pc.is_some_and(|prev| {
            Self::same_cache_line(prev, entry.addr(), self.options.line_size)
        });
        if same_line {
            return true;
        }
        state
            .l0_icache
            .as_mut()
            .is_some_and(|cache| cache.probe(entry.addr()))
    }

    fn same_cache_line(a: u64, b: u64, line_size: u32) -> bool {
        let shift = line_size.trailing_zeros();
        (a >> shift) == (b >> shift)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::arch::RegisterRole;
    use crate::host::{BufferAllocator, HeapAllocator};
    use crate::testutil::{FakeCleanCallSink, FakeScratchRegisters};

    fn scratch_pool() -> FakeScratchRegisters {
        FakeScratchRegisters::new(vec![
            RegisterRole::Counter,
            RegisterRole::Value,
            RegisterRole::ArgumentBlockPointer,
        ])
    }

    fn thread_state(opts: &TraceOptions) -> PerThreadState {
        let mut allocator: Box<dyn BufferAllocator> = Box::new(HeapAllocator);
        PerThreadState::new(
            1,
            allocator.as_mut(),
            4096,
            64,
            0,
            opts.l0_filter.then(|| opts.l0d_lines()),
            opts.l0_filter.then(|| opts.l0i_lines()),
            opts.line_size,
        )
        .unwrap()
    }

    fn read_mem(addr: u64) -> Instruction {
        Instruction {
            pc: addr,
            kind: InstructionKind::Plain {
                is_conditional: false,
                memory_refs: vec![MemRef { addr, is_write: false }],
            },
        }
    }

    fn plain(pc: u64) -> Instruction {
        Instruction::plain(pc)
    }

    #[test]
    fn test_memref_instruction_emits_instr_and_memref_entries() {
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let emitter = Emitter::new(Arch::X86_64, &opts);
        let mut state = thread_state(&opts);
        let mut scratch = scratch_pool();
        let mut sink = FakeCleanCallSink::default();
        let block = BasicBlock::new(vec![read_mem(0x1000)]);

        emitter
            .instrument_block(&block, &mut state, &mut scratch, &mut sink, |_| Ok(()))
            .unwrap();

        let entries = state.buf.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind(), EntryKind::Instr);
        assert_eq!(entries[1].kind(), EntryKind::DataRead);
        assert_eq!(entries[1].addr(), 0x1000);
    }

    #[test]
    fn test_delay_bundling_of_memref_free_run() {
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let emitter = Emitter::new(Arch::X86_64, &opts);
        let mut state = thread_state(&opts);
        let mut scratch = scratch_pool();
        let mut sink = FakeCleanCallSink::default();
        let block = BasicBlock::new(vec![
            plain(0x2000),
            plain(0x2004),
            plain(0x2008),
            read_mem(0x300c),
        ]);

        emitter
            .instrument_block(&block, &mut state, &mut scratch, &mut sink, |_| Ok(()))
            .unwrap();

        let entries = state.buf.entries();
        // First delayed instr gets a full entry, the next two are bundled, then the memref
        // instruction's own instr + memref entries.
        assert_eq!(entries[0].kind(), EntryKind::Instr);
        assert_eq!(entries[0].addr(), 0x2000);
        assert_eq!(entries[1].kind(), EntryKind::InstrBundle);
        assert_eq!(entries[1].aux(), 2);
        assert_eq!(entries[2].kind(), EntryKind::Instr);
        assert_eq!(entries[2].addr(), 0x300c);
        assert_eq!(entries[3].kind(), EntryKind::DataRead);
    }

    #[test]
    fn test_exclusive_store_deferred_to_next_instruction() {
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let emitter = Emitter::new(Arch::X86_64, &opts);
        let mut state = thread_state(&opts);
        let mut scratch = scratch_pool();
        let mut sink = FakeCleanCallSink::default();
        let strex = Instruction {
            pc: 0x4000,
            kind: InstructionKind::ExclusiveStore {
                base: RegisterRole::Counter,
                mem: MemRef { addr: 0x9000, is_write: true },
                writes_own_base: false,
            },
        };
        let block = BasicBlock::new(vec![strex, plain(0x4004)]);

        emitter
            .instrument_block(&block, &mut state, &mut scratch, &mut sink, |_| Ok(()))
            .unwrap();

        let entries = state.buf.entries();
        assert_eq!(entries[0].kind(), EntryKind::Instr);
        assert_eq!(entries[0].addr(), 0x4000);
        assert_eq!(entries[1].kind(), EntryKind::DataWrite);
        assert_eq!(entries[1].addr(), 0x9000);
    }

    #[test]
    fn test_self_based_exclusive_store_is_not_deferred() {
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let emitter = Emitter::new(Arch::X86_64, &opts);
        let mut state = thread_state(&opts);
        let mut scratch = scratch_pool();
        let mut sink = FakeCleanCallSink::default();
        let strex = Instruction {
            pc: 0x4000,
            kind: InstructionKind::ExclusiveStore {
                base: RegisterRole::Counter,
                mem: MemRef { addr: 0x9000, is_write: true },
                writes_own_base: true,
            },
        };
        let block = BasicBlock::new(vec![strex]);

        emitter
            .instrument_block(&block, &mut state, &mut scratch, &mut sink, |_| Ok(()))
            .unwrap();

        let entries = state.buf.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind(), EntryKind::Instr);
        assert_eq!(entries[1].kind(), EntryKind::DataWrite);
    }

    /// S4-adjacent: redzone trigger fires the supplied callback exactly once at end of block
    #[test]
    fn test_redzone_cross_invokes_callback() {
        let opts = TraceOptions::parse_from(["dbi-core"]);
        let emitter = Emitter::new(Arch::X86_64, &opts);
        // Tiny buffer: a single memref instruction writes two entries, overflowing a one-entry
        // trace region straight into the redzone.
        let mut allocator: Box<dyn BufferAllocator> = Box::new(HeapAllocator);
        let mut state = PerThreadState::new(
            1,
            allocator.as_mut(),
            crate::entry::ENTRY_SIZE,
            64,
            0,
            None,
            None,
            64,
        )
        .unwrap();
        let mut scratch = scratch_pool();
        let mut sink = FakeCleanCallSink::default();
        let block = BasicBlock::new(vec![read_mem(0x1000)]);
        let mut drained = false;

        emitter
            .instrument_block(&block, &mut state, &mut scratch, &mut sink, |_| {
                drained = true;
                Ok(())
            })
            .unwrap();

        assert!(drained);
        assert_eq!(sink.inserted.len(), 1);
    }

    /// Filter coherence (property 9): a hit on the same line produces no entry until eviction
    #[test]
    fn test_l0_filter_suppresses_repeat_access_to_same_line() {
        let mut opts = TraceOptions::parse_from(["dbi-core"]);
        opts.l0_filter = true;
        opts.l0d_size = 256;
        opts.line_size = 64;
        let emitter = Emitter::new(Arch::X86_64, &opts);
        let mut state = thread_state(&opts);
        let mut scratch = scratch_pool();
        let mut sink = FakeCleanCallSink::default();
        // Two reads to the same cache line; the instructions themselves have distinct PCs so
        // neither is skipped as a repstr duplicate.
        let block = BasicBlock::new(vec![
            Instruction {
                pc: 0x1000,
                kind: InstructionKind::Plain {
                    is_conditional: false,
                    memory_refs: vec![MemRef { addr: 0x2000, is_write: false }],
                },
            },
            Instruction {
                pc: 0x1004,
                kind: InstructionKind::Plain {
                    is_conditional: false,
                    memory_refs: vec![MemRef { addr: 0x2004, is_write: false }],
                },
            },
        ]);

        emitter
            .instrument_block(&block, &mut state, &mut scratch, &mut sink, |_| Ok(()))
            .unwrap();

        let entries = state.buf.entries();
        let data_entries = entries
            .iter()
            .filter(|e| e.kind() == EntryKind::DataRead)
            .count();
        assert_eq!(data_entries, 1);
    }
}
