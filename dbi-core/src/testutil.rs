//! In-memory fakes of the host collaborator traits
//!
//! The real DBI host provides scratch-register reservation, raw TLS, clean-call insertion, safe
//! memory reads, machine-context access and a transport for online mode; none of that exists
//! outside a live instrumentation session. These fakes let the registry, matcher, emitter and
//! drain logic run and be asserted against without a real host, mirroring how this codebase's own
//! `client-request-tests` stands a `valgrind-wrapper` test binary in for the real Valgrind tool.

use std::collections::HashMap;

use crate::arch::{RegisterRole, ScratchConstraint};
use crate::host::{
    BufferAllocator, CleanCall, CleanCallSink, MachineContext, MemoryReader, Transport, TlsSlot,
    TlsSlots,
};

/// A fake [`ScratchRegisters`](crate::host::ScratchRegisters) backed by a small fixed pool
///
/// Reservation respects [`ScratchConstraint`] the same way a real register allocator would: a
/// `MustBe` constraint is only satisfiable by that exact role, and `LowRegister` is satisfiable by
/// any role not currently held.
#[derive(Debug, Default)]
pub struct FakeScratchRegisters {
    held: Vec<RegisterRole>,
    pool: Vec<RegisterRole>,
}

impl FakeScratchRegisters {
    /// Build a fake allocator whose pool is `pool`, offered in order
    #[must_use]
    pub fn new(pool: Vec<RegisterRole>) -> Self {
        Self {
            held: Vec::new(),
            pool,
        }
    }
}

impl crate::host::ScratchRegisters for FakeScratchRegisters {
    fn reserve(&mut self, constraint: ScratchConstraint) -> Option<RegisterRole> {
        let idx = self.pool.iter().position(|candidate| match constraint {
            ScratchConstraint::MustBe(role) => *candidate == role,
            ScratchConstraint::LowRegister => true,
        })?;
        let reg = self.pool.remove(idx);
        self.held.push(reg);
        Some(reg)
    }

    fn release(&mut self, reg: RegisterRole) {
        if let Some(pos) = self.held.iter().position(|held| *held == reg) {
            self.held.remove(pos);
            self.pool.push(reg);
        }
    }
}

/// A fake [`TlsSlots`] backed by a `HashMap`, simulating a single thread's view of its own raw
/// slots (real TLS is implicitly per-thread; a test only ever drives one simulated thread at a
/// time through a given fake)
#[derive(Debug, Default)]
pub struct FakeTlsSlots {
    next_slot: u32,
    values: HashMap<TlsSlot, u64>,
}

impl TlsSlots for FakeTlsSlots {
    fn alloc_raw_slot(&mut self) -> TlsSlot {
        let slot = TlsSlot(self.next_slot);
        self.next_slot += 1;
        self.values.insert(slot, 0);
        slot
    }

    fn get(&self, slot: TlsSlot) -> u64 {
        *self.values.get(&slot).unwrap_or(&0)
    }

    fn set(&mut self, slot: TlsSlot, value: u64) {
        self.values.insert(slot, value);
    }
}

/// A fake [`CleanCallSink`] that just records the calls it was asked to insert, in order
#[derive(Debug, Default)]
pub struct FakeCleanCallSink {
    /// `(after_index, call)` pairs, in insertion order
    pub inserted: Vec<(usize, CleanCall)>,
}

impl CleanCallSink for FakeCleanCallSink {
    fn insert_clean_call(&mut self, after: usize, call: CleanCall) {
        self.inserted.push((after, call));
    }
}

/// A fake [`MemoryReader`] backed by an explicit address -> bytes map
#[derive(Debug, Default)]
pub struct FakeMemoryReader {
    regions: HashMap<u64, Vec<u8>>,
}

impl FakeMemoryReader {
    /// Build an empty reader (every address is unreadable until mapped)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bytes` readable starting at `addr`
    pub fn map(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }
}

impl MemoryReader for FakeMemoryReader {
    fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let bytes = self.regions.get(&addr)?;
        if bytes.len() < len {
            return None;
        }
        Some(bytes[..len].to_vec())
    }
}

/// A fake [`MachineContext`] backed by a register-role map
#[derive(Debug, Default)]
pub struct FakeMachineContext {
    registers: HashMap<RegisterRole, u64>,
}

impl MachineContext for FakeMachineContext {
    fn get_register(&self, role: RegisterRole) -> u64 {
        *self.registers.get(&role).unwrap_or(&0)
    }

    fn set_register(&mut self, role: RegisterRole, value: u64) {
        self.registers.insert(role, value);
    }
}

/// A fake [`Transport`] backed by an in-memory byte sink, simulating a named pipe with a
/// configurable atomic-write size
#[derive(Debug)]
pub struct FakeTransport {
    atomic_write_size: usize,
    /// Every chunk actually written, in order, for assertions
    pub chunks: Vec<Vec<u8>>,
    /// When set, the next `write_chunk` call reports writing one byte fewer than given, to
    /// exercise the short-write-is-fatal path
    pub force_short_write: bool,
}

impl FakeTransport {
    /// Build a fake pipe whose atomic-write guarantee is `atomic_write_size` bytes
    #[must_use]
    pub fn new(atomic_write_size: usize) -> Self {
        Self {
            atomic_write_size,
            chunks: Vec::new(),
            force_short_write: false,
        }
    }
}

impl Transport for FakeTransport {
    fn atomic_write_size(&self) -> usize {
        self.atomic_write_size
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.chunks.push(bytes.to_vec());
        if self.force_short_write {
            Ok(bytes.len().saturating_sub(1))
        } else {
            Ok(bytes.len())
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A fake [`BufferAllocator`] that fails on demand, for exercising the OOM-continuation path
/// (§4.4, §7) without needing to exhaust real memory
#[derive(Debug, Default)]
pub struct FaultyAllocator {
    /// 1-indexed call numbers that should fail; all other calls succeed
    pub fail_on_calls: Vec<u32>,
    calls: u32,
}

impl FaultyAllocator {
    /// Build an allocator that fails on the given 1-indexed call numbers
    #[must_use]
    pub fn failing_on(fail_on_calls: Vec<u32>) -> Self {
        Self {
            fail_on_calls,
            calls: 0,
        }
    }
}

impl BufferAllocator for FaultyAllocator {
    fn allocate(&mut self, len: usize) -> Option<Vec<u8>> {
        self.calls += 1;
        if self.fail_on_calls.contains(&self.calls) {
            None
        } else {
            Some(vec![0u8; len])
        }
    }
}

/// A fake [`AddressTranslator`](crate::host::AddressTranslator) backed by an explicit map; any
/// unmapped address translates to `0` (untranslatable)
#[derive(Debug, Default)]
pub struct FakeAddressTranslator {
    mapping: HashMap<u64, u64>,
}

impl FakeAddressTranslator {
    /// Build an empty translator (every address is untranslatable until mapped)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `virt` to `phys`
    pub fn map(&mut self, virt: u64, phys: u64) {
        self.mapping.insert(virt, phys);
    }
}

impl crate::host::AddressTranslator for FakeAddressTranslator {
    fn virtual_to_physical(&self, virt: u64) -> u64 {
        *self.mapping.get(&virt).unwrap_or(&0)
    }
}

/// A fake [`BufferHandoff`](crate::host::BufferHandoff) that records every handed-off buffer and
/// can be told to refuse the next one
#[derive(Debug, Default)]
pub struct FakeBufferHandoff {
    /// Every `(tid, bytes)` pair accepted so far
    pub accepted: Vec<(u32, Vec<u8>)>,
    /// When true, the next call to `handoff` returns `false` and is not recorded
    pub refuse_next: bool,
}

impl crate::host::BufferHandoff for FakeBufferHandoff {
    fn handoff(&mut self, tid: u32, bytes: Vec<u8>) -> bool {
        if self.refuse_next {
            self.refuse_next = false;
            return false;
        }
        self.accepted.push((tid, bytes));
        true
    }
}
