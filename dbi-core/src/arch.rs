//! Architecture-specific constants for the Valgrind client-request pattern
//!
//! The four-rotate-plus-exchange sequence that signals a client request is the same shape on
//! every architecture this crate recognizes; only the rotate immediates and the register roles
//! differ. This module collects that per-architecture table so the rest of the crate can stay
//! architecture-agnostic.

use std::fmt;

/// Number of rotate instructions that precede the exchange in a valid client-request sequence
pub const ROL_COUNT: usize = 4;

/// The architectures whose client-request encoding this crate recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86
    X86,
    /// 64-bit x86 (`x86_64`/`amd64`)
    X86_64,
    /// 32-bit ARM
    Arm,
    /// 64-bit ARM (`aarch64`)
    Aarch64,
}

impl Arch {
    /// The rotate immediates expected on this architecture, in program order
    ///
    /// The matcher checks these in reverse order against the four instructions preceding the
    /// exchange, since the rotates are read back-to-front from the call site.
    #[must_use]
    pub const fn expected_rol_immeds(self) -> [u8; ROL_COUNT] {
        match self {
            Self::X86_64 => [3, 13, 61, 51],
            Self::X86 | Self::Arm => [3, 13, 29, 19],
            Self::Aarch64 => [3, 13, 29, 19],
        }
    }

    /// The general-purpose register role that carries the client-request value and, on return,
    /// the result
    #[must_use]
    pub const fn value_register(self) -> RegisterRole {
        RegisterRole::Value
    }

    /// The general-purpose register role that carries the pointer to the argument block
    #[must_use]
    pub const fn argument_register(self) -> RegisterRole {
        RegisterRole::ArgumentBlockPointer
    }

    /// The general-purpose register role used to reach the instrumentation's own scratch
    /// reservation rules (e.g. `jecxz` on x86 needs `XCX`, `cbnz` on ARM needs a low register)
    #[must_use]
    pub const fn first_scratch_constraint(self) -> ScratchConstraint {
        match self {
            Self::X86 | Self::X86_64 => ScratchConstraint::MustBe(RegisterRole::Counter),
            Self::Arm | Self::Aarch64 => ScratchConstraint::LowRegister,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
            Self::Arm => "arm",
            Self::Aarch64 => "aarch64",
        };
        write!(f, "{name}")
    }
}

/// Architecture-independent roles for the general-purpose registers the client-request mechanism
/// and the instrumentation emitter care about
///
/// These correspond to the source lineage's "XBX", "XDI", "XAX", "XCX" naming, which is itself
/// a width-agnostic alias (`e`/`r` prefix chosen by the host runtime's own bitness).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRole {
    /// Carries the client-request value in and the handler's result out ("XBX")
    Value,
    /// Carries the pointer to the argument block ("XDI" at match time, "XAX" at dispatch time)
    ArgumentBlockPointer,
    /// The architecture's loop/counter register, needed for reach of short conditional jumps
    /// such as `jecxz` ("XCX")
    Counter,
}

/// A constraint on which scratch register the emitter may pick first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchConstraint {
    /// The register must be exactly this role
    MustBe(RegisterRole),
    /// Any register numbered at or below the architecture's low-register boundary is acceptable
    LowRegister,
}
