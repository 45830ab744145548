//! Trace entry encoding
//!
//! A [`Entry`] is the fixed-size record the emitter writes into a thread's buffer and the drain
//! component walks back out. The host runtime's own instruction-analysis collaborator is the
//! thing that would normally own this encoding end to end (hence "opaque" in the design); this
//! crate fixes a concrete, compact layout so the buffer, filter and drain logic have something
//! real to operate on and test against.

use std::convert::TryInto;

/// Byte width of every [`Entry`], regardless of kind
pub const ENTRY_SIZE: usize = 16;

/// The kind of a [`Entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// A single instruction fetch
    Instr = 0,
    /// A bundle covering several consecutive, delay-bundled instruction fetches
    InstrBundle = 1,
    /// A unit header: marks the start of a drained chunk, carries the thread ID
    Thread = 2,
    /// A thread-exit footer
    ThreadExit = 3,
    /// A process-ID header
    Pid = 4,
    /// A memory read reference
    DataRead = 5,
    /// A memory write reference
    DataWrite = 6,
    /// A memory read-modify-write reference
    DataModify = 7,
}

impl EntryKind {
    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Instr),
            1 => Some(Self::InstrBundle),
            2 => Some(Self::Thread),
            3 => Some(Self::ThreadExit),
            4 => Some(Self::Pid),
            5 => Some(Self::DataRead),
            6 => Some(Self::DataWrite),
            7 => Some(Self::DataModify),
            _ => None,
        }
    }

    /// True for the three data-reference kinds the drain component rewrites under
    /// `use_physical`
    #[must_use]
    pub const fn is_data_ref(self) -> bool {
        matches!(self, Self::DataRead | Self::DataWrite | Self::DataModify)
    }
}

/// A single fixed-size trace record
///
/// Layout (little-endian): `[kind: u8][_pad: u8; 3][addr: u64][aux: u32]`. `aux` carries the
/// thread ID for [`EntryKind::Thread`]/[`EntryKind::ThreadExit`]/[`EntryKind::Pid`] entries and
/// the instruction-bundle length for [`EntryKind::InstrBundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    kind: EntryKind,
    addr: u64,
    aux: u32,
}

impl Entry {
    /// Build a new entry of the given `kind` at `addr`, with an auxiliary payload
    #[must_use]
    pub const fn new(kind: EntryKind, addr: u64, aux: u32) -> Self {
        Self { kind, addr, aux }
    }

    /// Build a unit-header entry tagging the emitting thread's ID
    #[must_use]
    pub const fn thread_header(tid: u32) -> Self {
        Self::new(EntryKind::Thread, 0, tid)
    }

    /// Build a thread-exit footer entry
    #[must_use]
    pub const fn thread_exit(tid: u32) -> Self {
        Self::new(EntryKind::ThreadExit, 0, tid)
    }

    /// This entry's kind
    #[must_use]
    pub const fn kind(&self) -> EntryKind {
        self.kind
    }

    /// This entry's address field
    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// This entry's auxiliary field
    #[must_use]
    pub const fn aux(&self) -> u32 {
        self.aux
    }

    /// Overwrite the address field, used by the drain component's physical-address rewrite
    pub fn set_addr(&mut self, addr: u64) {
        self.addr = addr;
    }

    /// Encode this entry into the first [`ENTRY_SIZE`] bytes of `out`
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`ENTRY_SIZE`].
    pub fn write_into(&self, out: &mut [u8]) {
        assert!(out.len() >= ENTRY_SIZE, "buffer too small for an entry");
        out[0] = self.kind as u8;
        out[1..4].fill(0);
        out[4..12].copy_from_slice(&self.addr.to_le_bytes());
        out[12..16].copy_from_slice(&self.aux.to_le_bytes());
    }

    /// Decode an entry from the first [`ENTRY_SIZE`] bytes of `bytes`
    ///
    /// Returns `None` if `bytes` is too short or carries an unrecognized kind tag (the redzone
    /// sentinel decodes to `None` this way, which callers use to detect buffer end).
    #[must_use]
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENTRY_SIZE {
            return None;
        }
        let kind = EntryKind::from_tag(bytes[0])?;
        let addr = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let aux = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self { kind, addr, aux })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_round_trip() {
        let entry = Entry::new(EntryKind::DataWrite, 0xdead_beef, 8);
        let mut buf = [0u8; ENTRY_SIZE];
        entry.write_into(&mut buf);
        assert_eq!(Entry::read_from(&buf), Some(entry));
    }

    #[test]
    fn test_thread_header_roundtrip() {
        let header = Entry::thread_header(42);
        let mut buf = [0u8; ENTRY_SIZE];
        header.write_into(&mut buf);
        let decoded = Entry::read_from(&buf).unwrap();
        assert_eq!(decoded.kind(), EntryKind::Thread);
        assert_eq!(decoded.aux(), 42);
    }

    #[test]
    fn test_read_from_sentinel_is_none() {
        let sentinel = [0xffu8; ENTRY_SIZE];
        assert_eq!(Entry::read_from(&sentinel), None);
    }

    #[test]
    fn test_is_data_ref() {
        assert!(EntryKind::DataRead.is_data_ref());
        assert!(!EntryKind::Instr.is_data_ref());
    }
}
