//! Configuration surface recognized at process init
//!
//! [`TraceOptions`] is parsed once, from the argument vector the host runtime hands the client,
//! and carried thereafter inside the core context, immutable. The struct mirrors every row of the
//! tracer's configuration table and is validated once via [`TraceOptions::validate`].

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::error::Error;

/// Default cache geometry, in bytes, for the level-0 data and instruction filters
const DEFAULT_CACHE_SIZE: u32 = 32 * 1024;
/// Default cache line size, in bytes, for the level-0 filters
const DEFAULT_LINE_SIZE: u32 = 64;

/// Configuration recognized by the tracer at process init
///
/// Parsed once with [`clap::Parser::parse_from`] from the argument vector the host runtime
/// passes to the client at attach time, then validated and frozen into the core context.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "dbi-core", author, version, about = None, long_about = None)]
pub struct TraceOptions {
    /// Write one trace file per thread under `outdir` instead of streaming over a named pipe
    #[arg(
        long = "offline",
        default_value_t = false,
        default_missing_value = "true",
        num_args = 0..=1,
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        env = "DBI_CORE_OFFLINE"
    )]
    pub offline: bool,

    /// Parent directory for offline output; a unique `<appid>.<pid>.dir` subdirectory is created
    /// under it at process init
    #[arg(long = "outdir", env = "DBI_CORE_OUTDIR", default_value = ".")]
    pub outdir: String,

    /// Named-pipe identifier used for online mode
    #[arg(long = "ipc-name", env = "DBI_CORE_IPC_NAME", default_value = "dbi-core")]
    pub ipc_name: String,

    /// Translate virtual addresses in data entries to physical addresses before draining
    #[arg(
        long = "use-physical",
        default_value_t = false,
        default_missing_value = "true",
        num_args = 0..=1,
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        env = "DBI_CORE_USE_PHYSICAL"
    )]
    pub use_physical: bool,

    /// Enable the inline, direct-mapped level-0 cache filter
    #[arg(
        long = "l0-filter",
        default_value_t = false,
        default_missing_value = "true",
        num_args = 0..=1,
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        env = "DBI_CORE_L0_FILTER"
    )]
    pub l0_filter: bool,

    /// Size, in bytes, of the level-0 data cache filter; must be a power of two
    #[arg(long = "l0d-size", env = "DBI_CORE_L0D_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    pub l0d_size: u32,

    /// Size, in bytes, of the level-0 instruction cache filter; must be a power of two
    #[arg(long = "l0i-size", env = "DBI_CORE_L0I_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    pub l0i_size: u32,

    /// Cache line size, in bytes, shared by both level-0 filters; must be a power of two
    #[arg(long = "line-size", env = "DBI_CORE_LINE_SIZE", default_value_t = DEFAULT_LINE_SIZE)]
    pub line_size: u32,

    /// Cap on the total number of bytes emitted per thread; zero means unlimited
    #[arg(long = "max-trace-size", env = "DBI_CORE_MAX_TRACE_SIZE", default_value_t = 0)]
    pub max_trace_size: u64,

    /// Emit distinct instruction-type entries in online mode
    #[arg(
        long = "online-instr-types",
        default_value_t = false,
        default_missing_value = "true",
        num_args = 0..=1,
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        env = "DBI_CORE_ONLINE_INSTR_TYPES"
    )]
    pub online_instr_types: bool,

    /// Logging verbosity, forwarded to the `log` facade's filter
    #[arg(long = "verbose", short = 'v', action = ArgAction::Count, env = "DBI_CORE_VERBOSE")]
    pub verbose: u8,
}

impl TraceOptions {
    /// Validate the combination of options, returning [`Error::InvalidConfiguration`] on the
    /// first violation found
    pub fn validate(&self) -> Result<(), Error> {
        if !self.line_size.is_power_of_two() {
            return Err(Error::InvalidConfiguration(format!(
                "line_size must be a power of two, got {}",
                self.line_size
            )));
        }
        if self.l0_filter {
            if !self.l0d_size.is_power_of_two() {
                return Err(Error::InvalidConfiguration(format!(
                    "l0d_size must be a power of two, got {}",
                    self.l0d_size
                )));
            }
            if !self.l0i_size.is_power_of_two() {
                return Err(Error::InvalidConfiguration(format!(
                    "l0i_size must be a power of two, got {}",
                    self.l0i_size
                )));
            }
            if self.l0d_size < self.line_size || self.l0i_size < self.line_size {
                return Err(Error::InvalidConfiguration(
                    "l0d_size and l0i_size must each be at least line_size".to_owned(),
                ));
            }
        }
        if self.offline && self.ipc_name != "dbi-core" {
            log::debug!("ipc_name is ignored while offline is set");
        }
        Ok(())
    }

    /// Number of direct-mapped lines in the level-0 data cache filter
    #[must_use]
    pub fn l0d_lines(&self) -> u32 {
        self.l0d_size / self.line_size
    }

    /// Number of direct-mapped lines in the level-0 instruction cache filter
    #[must_use]
    pub fn l0i_lines(&self) -> u32 {
        self.l0i_size / self.line_size
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn options() -> TraceOptions {
        TraceOptions::parse_from(["dbi-core"])
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(options().validate().is_ok());
    }

    #[rstest]
    #[case::line_size(3)]
    #[case::line_size_large(100)]
    fn test_validate_rejects_non_power_of_two_line_size(#[case] line_size: u32) {
        let mut opts = options();
        opts.line_size = line_size;
        assert_eq!(
            opts.validate(),
            Err(Error::InvalidConfiguration(format!(
                "line_size must be a power of two, got {line_size}"
            )))
        );
    }

    #[test]
    fn test_validate_rejects_cache_smaller_than_line() {
        let mut opts = options();
        opts.l0_filter = true;
        opts.l0d_size = 16;
        opts.line_size = 64;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_l0_lines() {
        let mut opts = options();
        opts.l0d_size = 32 * 1024;
        opts.line_size = 64;
        assert_eq!(opts.l0d_lines(), 512);
    }
}
