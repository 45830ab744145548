//! Annotation dispatch and memory-trace tracer core for a dynamic binary instrumentation client
//!
//! This crate implements the two subsystems of a DBI client that interleave most tightly with
//! generated machine code:
//!
//! - an **annotation recognition and dispatch engine** ([`registry`], [`matcher`],
//!   [`vg_dispatch`]) that detects in-application markers — direct calls to a registered sentinel
//!   function, or the four-rotate-plus-exchange Valgrind client-request pattern — and reroutes
//!   them to callbacks registered by client extensions, and
//! - a **memory-trace tracer** ([`buffer`], [`emitter`], [`drain`], [`entry`]) that instruments
//!   every basic block to emit compact memory-reference and instruction-fetch records into
//!   per-thread buffers, drains those buffers to an offline file or a named pipe, and can
//!   short-circuit recording through an inline direct-mapped cache filter ([`arch`]).
//!
//! [`lifecycle`] ties both subsystems together across process init, thread init/exit, fork, and
//! process exit. [`host`] defines the narrow set of contracts this crate expects from the host DBI
//! runtime (instruction decoding/encoding, code-cache editing, scratch-register reservation, raw
//! TLS, clean calls, safe memory reads, machine-context access) — the runtime itself is out of
//! scope here and is only ever referenced through those trait objects. [`testutil`] (behind the
//! `test-util` feature, and always available to this crate's own tests) provides in-memory fakes
//! of those traits so the rest of the crate can be exercised without a live instrumentation
//! session.

#![warn(clippy::pedantic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::else_if_without_else)]
#![warn(clippy::fn_to_numeric_cast_any)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::if_then_some_else_none)]
#![warn(clippy::needless_collect)]
#![warn(clippy::str_to_string)]
#![warn(clippy::string_to_string)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unneeded_field_pattern)]
#![warn(missing_docs)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]

pub mod arch;
pub mod block;
pub mod buffer;
pub mod drain;
pub mod emitter;
pub mod entry;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod matcher;
pub mod options;
pub mod registry;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod vg_dispatch;

pub use arch::Arch;
pub use error::Error;
pub use options::TraceOptions;
pub use registry::HandlerRegistry;
