//! Valgrind client-request dispatch
//!
//! Runs inside the clean call the matcher spliced in place of the rotate-plus-exchange sequence
//! (§4.2(b)): reads the argument block the instrumented program built right before issuing the
//! request, looks up a registered handler by request number, and writes the result back into the
//! "XBX" register the request's caller reads its answer from.

use log::{debug, trace};

use crate::arch::RegisterRole;
use crate::host::{MachineContext, MemoryReader};
use crate::registry::HandlerRegistry;

/// Fixed byte layout of the client-request argument block this crate reads out of the
/// instrumented program's memory
///
/// `[request_number: u64][args: u64; 4][default_result: u64]`, little-endian, matching the shape
/// the Valgrind client-request macro expansion builds on the stack before the rotate sequence.
pub const REQUEST_BLOCK_SIZE: usize = 8 * 7;

/// A decoded client-request argument block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBlock {
    /// The wire-format request number, before translation to an internal ID
    pub request_number: u64,
    /// Up to four request-specific argument words
    pub args: [u64; 4],
    /// The value to use if the request number has no registered handler
    pub default_result: u64,
}

impl RequestBlock {
    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < REQUEST_BLOCK_SIZE {
            return None;
        }
        let word = |i: usize| -> Option<u64> {
            Some(u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().ok()?))
        };
        Some(Self {
            request_number: word(0)?,
            args: [word(1)?, word(2)?, word(3)?, word(4)?],
            default_result: word(5)?,
        })
    }
}

/// The highest request ID [`HandlerRegistry`]'s direct-indexed array accepts, re-exported here for
/// callers translating a wire-format request number
pub use crate::registry::VG_LAST;

/// A stable, bounded index into [`HandlerRegistry`]'s direct-indexed Valgrind handler array
///
/// Distinguishes a translated request ID from the raw, untranslated wire-format `u64` at the type
/// level; [`HandlerRegistry::lookup_valgrind`] still takes a bare `usize`, so callers unwrap via
/// `.0` at that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub usize);

/// Translate a wire-format request number into the registry's internal index
///
/// The real Valgrind request-number encoding packs a two-character tool signature into the high
/// bits (see [`vg_userreq_tool_base`]); this crate's concern is only the translation's *shape* (a
/// stable, bounded index), so it takes the low bits modulo [`VG_LAST`]. Out-of-range results
/// (there are none, by construction) would be rejected by the registry itself.
#[must_use]
pub fn translate_request_number(request_number: u64) -> RequestId {
    RequestId((request_number as usize) % VG_LAST)
}

/// Computes the reference Valgrind client-request base for a two-character tool signature
///
/// Mirrors `VG_USERREQ_TOOL_BASE(a, b)` from the Valgrind client-request header: packs the
/// signature into bits 16-31 of a wire-format request number, the same bits a real tool (e.g.
/// Callgrind's `'C','T'`) reserves for its own request range. Useful for building request-number
/// test fixtures and documentation examples that look like real tool requests.
#[must_use]
pub fn vg_userreq_tool_base(sig: [u8; 2]) -> u64 {
    (u64::from(sig[0]) & 0xff) << 24 | (u64::from(sig[1]) & 0xff) << 16
}

/// Run the Valgrind dispatch clean call: `handle_vg_annotation(request_args_ptr)`
///
/// Reads the argument block from `request_args_ptr` via `reader`; on a safe-read failure, returns
/// without touching `mach` at all, per §4.3 step 1 and the error taxonomy's silent-return policy.
/// Otherwise always writes a result into the "XBX" register: the registered handler's return
/// value if one is registered for the translated request ID, else the block's `default_result`.
pub fn handle_vg_annotation(
    registry: &HandlerRegistry,
    reader: &dyn MemoryReader,
    mach: &mut dyn MachineContext,
    request_args_ptr: u64,
) {
    let Some(bytes) = reader.read(request_args_ptr, REQUEST_BLOCK_SIZE) else {
        trace!("valgrind dispatch: unreadable argument block at {request_args_ptr:#x}");
        return;
    };
    let Some(block) = RequestBlock::decode(&bytes) else {
        trace!("valgrind dispatch: short argument block at {request_args_ptr:#x}");
        return;
    };

    let mut result = block.default_result;
    let internal_id = translate_request_number(block.request_number);
    if let Some(callback) = registry.lookup_valgrind(internal_id.0) {
        let mut arg_bytes = Vec::with_capacity(32);
        for arg in block.args {
            arg_bytes.extend_from_slice(&arg.to_le_bytes());
        }
        result = callback(&arg_bytes);
        debug!(
            "valgrind dispatch: request {:#x} -> internal id {} handled, result \
             {result:#x}",
            block.request_number, internal_id.0
        );
    } else {
        debug!(
            "valgrind dispatch: request {:#x} -> internal id {} has no handler, using \
             default result {result:#x}",
            block.request_number, internal_id.0
        );
    }

    mach.set_register(RegisterRole::Value, result);
}
