//! The decoded-instruction and basic-block data the matcher and emitter operate on
//!
//! The host DBI runtime owns the real instruction decoder, encoder and code-cache editor; this
//! module is the thin, concrete shape this crate needs from that decoder to do its work. It is
//! deliberately data, not a trait: a basic block here is something the matcher and emitter can
//! inspect and splice synthetically-constructed instructions into without any live JIT behind it.
//! The genuinely host-specific, stateful services (scratch-register reservation, TLS, clean
//! calls, safe memory reads) live behind the traits in [`crate::host`].

use crate::arch::RegisterRole;

/// A source or destination memory reference carried by an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    /// The address this instruction reads or writes, if known statically; resolved operands with
    /// a runtime-only address are represented with `addr = 0` and are still counted
    pub addr: u64,
    /// True for a write (or the write half of a read-modify-write); false for a read
    pub is_write: bool,
}

/// What kind of instruction this is, to the extent the matcher or emitter care
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionKind {
    /// A direct call to a fixed target address
    DirectCall {
        /// The call's fixed target address
        target: u64,
    },
    /// A rotate instruction, as used by the Valgrind client-request sequence
    Rotate {
        /// The register the rotate writes to
        dest: RegisterRole,
        /// The rotate's immediate shift count
        immediate: u8,
    },
    /// An exchange instruction (`xchg reg, reg`)
    Exchange {
        /// The exchange's first operand
        left: RegisterRole,
        /// The exchange's second operand
        right: RegisterRole,
    },
    /// An exclusive store (e.g. ARM `strex`)
    ExclusiveStore {
        /// The register the store's address is computed from
        base: RegisterRole,
        /// The memory location the store writes
        mem: MemRef,
        /// True if the store writes to its own base register (the emitter's deferral exception:
        /// such a store must be instrumented in place, not deferred to the following instruction)
        writes_own_base: bool,
    },
    /// A synthetic, non-rewritable marker instruction spliced in by the annotation matcher
    AnnotationMarker {
        /// The handler this marker dispatches to, identified by its call-site address
        target_pc: u64,
    },
    /// Anything else: ordinary application code
    Plain {
        /// True if this instruction only executes under a predicate
        is_conditional: bool,
        /// This instruction's memory references, sources before destinations
        memory_refs: Vec<MemRef>,
    },
}

/// A single decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The instrumented program's address this instruction lives at
    pub pc: u64,
    /// What this instruction is
    pub kind: InstructionKind,
}

impl Instruction {
    /// Build a plain, unconditional instruction with no memory references
    #[must_use]
    pub fn plain(pc: u64) -> Self {
        Self {
            pc,
            kind: InstructionKind::Plain {
                is_conditional: false,
                memory_refs: Vec::new(),
            },
        }
    }

    /// True if this is an [`InstructionKind::DirectCall`]
    #[must_use]
    pub fn is_direct_call(&self) -> bool {
        matches!(self.kind, InstructionKind::DirectCall { .. })
    }

    /// The call target, if this is a direct call
    #[must_use]
    pub fn call_target(&self) -> Option<u64> {
        match self.kind {
            InstructionKind::DirectCall { target } => Some(target),
            _ => None,
        }
    }

    /// True if this is an [`InstructionKind::ExclusiveStore`]
    #[must_use]
    pub fn is_exclusive_store(&self) -> bool {
        matches!(self.kind, InstructionKind::ExclusiveStore { .. })
    }

    /// True if this is an exclusive store that writes to its own base register, the exception
    /// that keeps the emitter from deferring its instrumentation to the next instruction
    #[must_use]
    pub fn exclusive_store_writes_own_base(&self) -> bool {
        matches!(
            self.kind,
            InstructionKind::ExclusiveStore {
                writes_own_base: true,
                ..
            }
        )
    }

    /// True if this instruction carries no memory references and is not an annotation marker or
    /// call (plain "delay-bundleable" instructions only)
    #[must_use]
    pub fn has_no_memory_refs(&self) -> bool {
        matches!(
            &self.kind,
            InstructionKind::Plain { memory_refs, .. } if memory_refs.is_empty()
        )
    }

    /// True if this instruction only executes under a predicate
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        matches!(
            self.kind,
            InstructionKind::Plain {
                is_conditional: true,
                ..
            }
        )
    }

    /// This instruction's memory references, sources before destinations
    #[must_use]
    pub fn memory_refs(&self) -> &[MemRef] {
        match &self.kind {
            InstructionKind::Plain { memory_refs, .. } => memory_refs,
            InstructionKind::ExclusiveStore { mem, .. } => std::slice::from_ref(mem),
            _ => &[],
        }
    }
}

/// A maximal straight-line sequence of application instructions with one entry and one exit
///
/// The unit the host runtime hands the [`crate::matcher`] and [`crate::emitter`] for inspection
/// and in-place editing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlock {
    instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Build a basic block from a sequence of instructions
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// This block's instructions, in program order
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Mutable access to this block's instructions, for in-place editing
    pub fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instructions
    }

    /// Replace the last `count` instructions with `replacement`
    ///
    /// Used by the Valgrind pattern matcher to destroy the five-instruction client-request
    /// sequence and splice in its replacement.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the number of instructions in the block.
    pub fn splice_tail(&mut self, count: usize, replacement: Vec<Instruction>) {
        let split_at = self.instructions.len() - count;
        self.instructions.truncate(split_at);
        self.instructions.extend(replacement);
    }

    /// Insert `marker` immediately after the instruction at index `after`
    pub fn insert_after(&mut self, after: usize, marker: Instruction) {
        self.instructions.insert(after + 1, marker);
    }

    /// Insert every instruction in `markers`, in order, immediately after the instruction at
    /// index `after`
    pub fn insert_many_after(&mut self, after: usize, markers: Vec<Instruction>) {
        let at = after + 1;
        self.instructions.splice(at..at, markers);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_splice_tail_replaces_only_the_trailing_instructions() {
        let mut block = BasicBlock::new(vec![
            Instruction::plain(0x1000),
            Instruction::plain(0x1004),
            Instruction::plain(0x1008),
        ]);
        block.splice_tail(2, vec![Instruction::plain(0x9999)]);
        assert_eq!(block.instructions().len(), 2);
        assert_eq!(block.instructions()[0].pc, 0x1000);
        assert_eq!(block.instructions()[1].pc, 0x9999);
    }

    #[test]
    fn test_insert_after() {
        let mut block = BasicBlock::new(vec![Instruction::plain(0x1000), Instruction::plain(0x1004)]);
        block.insert_after(
            0,
            Instruction {
                pc: 0x1000,
                kind: InstructionKind::AnnotationMarker { target_pc: 0x400100 },
            },
        );
        assert_eq!(block.instructions().len(), 3);
        assert!(matches!(
            block.instructions()[1].kind,
            InstructionKind::AnnotationMarker { target_pc: 0x400100 }
        ));
    }
}
