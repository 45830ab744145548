//! Annotation matcher: direct-call markers and the Valgrind four-rotate-plus-exchange pattern
//!
//! Two independent modes, corresponding to the two shapes an annotation takes in the instrumented
//! program's instruction stream: a direct call to a registered sentinel function, and the rotate
//! sequence the Valgrind client-request macro expands to. Both run against a single decoded
//! instruction or basic block handed in by the host runtime; neither mode touches the registry's
//! write lock.

use crate::arch::{Arch, RegisterRole};
use crate::block::{BasicBlock, Instruction, InstructionKind};
use crate::registry::HandlerRegistry;

/// One synthetic marker instruction produced for a direct-call annotation
///
/// Carries no real machine semantics: a label the downstream mangler must not rewrite, tagged
/// with the handler it dispatches to. The host runtime splices the returned chain into the basic
/// block at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationMarker {
    /// The original call-site address this marker answers for
    pub target_pc: u64,
    /// True: the downstream instruction mangler must leave this instruction alone
    pub non_rewritable: bool,
}

/// Build the chain of synthetic marker instructions for a direct-call annotation at `instr`
///
/// Returns `None` if `instr` is not a direct call, or if no handler chain is registered at its
/// target. One marker is emitted per link in the chain (today always a chain of length one; see
/// the registration duplicate-policy design note).
#[must_use]
pub fn match_direct_call(
    registry: &HandlerRegistry,
    instr: &Instruction,
) -> Option<Vec<AnnotationMarker>> {
    let target = instr.call_target()?;
    let chain = registry.lookup(target);
    if chain.is_empty() {
        return None;
    }
    Some(
        chain
            .iter()
            .map(|_| AnnotationMarker {
                target_pc: target,
                non_rewritable: true,
            })
            .collect(),
    )
}

/// Splice `markers` into `block` immediately after the call instruction at index `call_idx`, as
/// [`InstructionKind::AnnotationMarker`] instructions doubly linked into the returned chain by
/// virtue of occupying consecutive positions in the block's instruction vector
pub fn splice_markers(block: &mut BasicBlock, call_idx: usize, markers: Vec<AnnotationMarker>) {
    let call_pc = block.instructions()[call_idx].pc;
    let synthetic: Vec<Instruction> = markers
        .into_iter()
        .map(|marker| Instruction {
            pc: call_pc,
            kind: InstructionKind::AnnotationMarker {
                target_pc: marker.target_pc,
            },
        })
        .collect();
    block.insert_many_after(call_idx, synthetic);
}

/// Attempt to match the Valgrind four-rotate-plus-exchange client-request pattern ending at
/// `exchange_idx` in `block`
///
/// Preconditions (checked here, not assumed): `block.instructions()[exchange_idx]` is an exchange
/// of the architecture's "XBX" register with itself, and the four instructions immediately before
/// it are rotates of "XDI" whose immediates equal `arch.expected_rol_immeds()` in reverse order.
///
/// On a match, destroys those five instructions and appends a zero-register instruction
/// (translation-tagged to the exchange's original PC) and an [`InstructionKind::AnnotationMarker`]
/// standing in for the clean call to the Valgrind dispatcher. Returns `true` on a match; the block
/// is left untouched on a mismatch.
pub fn match_valgrind_pattern(arch: Arch, block: &mut BasicBlock, exchange_idx: usize) -> bool {
    const ROL_COUNT: usize = crate::arch::ROL_COUNT;

    if exchange_idx < ROL_COUNT {
        return false;
    }
    let exchange_pc;
    {
        let instructions = block.instructions();
        let exchange = &instructions[exchange_idx];
        let (left, right) = match &exchange.kind {
            InstructionKind::Exchange { left, right } => (*left, *right),
            _ => return false,
        };
        if left != RegisterRole::Value || right != RegisterRole::Value {
            return false;
        }

        let expected = arch.expected_rol_immeds();
        for i in 0..ROL_COUNT {
            let rotate = &instructions[exchange_idx - 1 - i];
            match &rotate.kind {
                InstructionKind::Rotate { dest, immediate } => {
                    if *dest != RegisterRole::ArgumentBlockPointer
                        || *immediate != expected[ROL_COUNT - 1 - i]
                    {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        exchange_pc = exchange.pc;
    }

    let replacement = vec![
        Instruction {
            pc: exchange_pc,
            kind: InstructionKind::Exchange {
                left: RegisterRole::Value,
                right: RegisterRole::Value,
            },
        },
        Instruction {
            pc: exchange_pc,
            kind: InstructionKind::AnnotationMarker {
                // Not a real call-site handler lookup key: this marker stands for the
                // `handle_vg_annotation(XAX)` clean call, not a registry entry.
                target_pc: exchange_pc,
            },
        },
    ];
    block.splice_tail(ROL_COUNT + 1, replacement);
    true
}

/// Zero-register "xor reg,reg" instruction produced on a Valgrind pattern match
///
/// The first instruction of [`match_valgrind_pattern`]'s replacement is always this shape; exposed
/// as a predicate so callers and tests can recognize it without depending on field layout.
#[must_use]
pub fn is_valgrind_clear(instr: &Instruction) -> bool {
    matches!(
        instr.kind,
        InstructionKind::Exchange {
            left: RegisterRole::Value,
            right: RegisterRole::Value,
        }
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::sync::Arc;

    use super::*;

    fn rotate(pc: u64, immediate: u8) -> Instruction {
        Instruction {
            pc,
            kind: InstructionKind::Rotate {
                dest: RegisterRole::ArgumentBlockPointer,
                immediate,
            },
        }
    }

    fn exchange(pc: u64) -> Instruction {
        Instruction {
            pc,
            kind: InstructionKind::Exchange {
                left: RegisterRole::Value,
                right: RegisterRole::Value,
            },
        }
    }

    fn valgrind_block(arch: Arch, exchange_pc: u64) -> BasicBlock {
        let immeds = arch.expected_rol_immeds();
        BasicBlock::new(vec![
            rotate(exchange_pc - 8, immeds[0]),
            rotate(exchange_pc - 6, immeds[1]),
            rotate(exchange_pc - 4, immeds[2]),
            rotate(exchange_pc - 2, immeds[3]),
            exchange(exchange_pc),
        ])
    }

    /// S1: x86 immediates {3,13,29,19}
    #[rstest]
    #[case::x86(Arch::X86)]
    #[case::arm(Arch::Arm)]
    fn test_match_valgrind_pattern_32bit(#[case] arch: Arch) {
        let mut block = valgrind_block(arch, 0x4000);
        assert!(match_valgrind_pattern(arch, &mut block, 4));
        assert_eq!(block.instructions().len(), 2);
        assert!(is_valgrind_clear(&block.instructions()[0]));
        assert_eq!(block.instructions()[0].pc, 0x4000);
        assert!(matches!(
            block.instructions()[1].kind,
            InstructionKind::AnnotationMarker { .. }
        ));
    }

    /// S2: x64 immediates {3,13,61,51}
    #[test]
    fn test_match_valgrind_pattern_x64() {
        let mut block = valgrind_block(Arch::X86_64, 0x4000);
        assert!(match_valgrind_pattern(Arch::X86_64, &mut block, 4));
        assert_eq!(block.instructions().len(), 2);
    }

    #[test]
    fn test_mismatched_immediate_leaves_block_untouched() {
        let mut block = valgrind_block(Arch::X86, 0x4000);
        // Corrupt one immediate so the x64 check, applied to an x86 block, fails.
        assert!(!match_valgrind_pattern(Arch::X86_64, &mut block, 4));
        assert_eq!(block.instructions().len(), 5);
    }

    #[test]
    fn test_exchange_on_different_registers_does_not_match() {
        let mut block = valgrind_block(Arch::X86, 0x4000);
        block.instructions_mut()[4] = Instruction {
            pc: 0x4000,
            kind: InstructionKind::Exchange {
                left: RegisterRole::Value,
                right: RegisterRole::Counter,
            },
        };
        assert!(!match_valgrind_pattern(Arch::X86, &mut block, 4));
    }

    /// S3: registration then direct-call matching produces one annotation marker
    #[test]
    fn test_match_direct_call_produces_one_marker_per_chain_entry() {
        let registry = HandlerRegistry::new();
        registry.register_return(0x400100, 1);
        let call = Instruction {
            pc: 0x5000,
            kind: InstructionKind::DirectCall { target: 0x400100 },
        };
        let markers = match_direct_call(&registry, &call).expect("handler registered");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].target_pc, 0x400100);
        assert!(markers[0].non_rewritable);
    }

    #[test]
    fn test_match_direct_call_with_no_handler_is_none() {
        let registry = HandlerRegistry::new();
        let call = Instruction {
            pc: 0x5000,
            kind: InstructionKind::DirectCall { target: 0xdead },
        };
        assert!(match_direct_call(&registry, &call).is_none());
    }

    #[test]
    fn test_splice_markers_inserts_after_call_site() {
        let registry = HandlerRegistry::new();
        registry.register_call(0x400100, Arc::new(|_| 0), false, Vec::new());
        let mut block = BasicBlock::new(vec![
            Instruction::plain(0x4ff0),
            Instruction {
                pc: 0x4ff4,
                kind: InstructionKind::DirectCall { target: 0x400100 },
            },
            Instruction::plain(0x4ff8),
        ]);
        let markers = match_direct_call(&registry, &block.instructions()[1]).unwrap();
        splice_markers(&mut block, 1, markers);
        assert_eq!(block.instructions().len(), 4);
        assert!(matches!(
            block.instructions()[2].kind,
            InstructionKind::AnnotationMarker { target_pc: 0x400100 }
        ));
    }
}
