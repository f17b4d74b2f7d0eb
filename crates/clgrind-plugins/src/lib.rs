//! Dynamic analyses for the clgrind simulator
//!
//! Every analysis is a [`clgrind_core::Plugin`]. Analyses that report
//! findings hold a clone of the context's [`clgrind_core::DiagnosticSink`],
//! so findings are deduplicated and capped like the simulator's own errors.
//!
//! | Plugin | Reports |
//! |--------|---------|
//! | [`Uninitialized`] | poisoned data read from or written to global memory, or used as a branch condition, index or pointer |
//! | [`RaceDetector`] | unsynchronized conflicting accesses to local and global memory |
//! | [`MemCheck`] | access-qualifier violations and host writes to read-mapped regions |
//! | [`InstructionCounter`] | nothing; exposes a per-kernel [`InstructionReport`] |
//! | [`Logger`] | forwards diagnostics to `tracing` |
//! | [`DiagnosticCollector`] | keeps diagnostics in memory |
//!
//! # Usage
//!
//! ```rust
//! use clgrind_core::{Context, SimulatorConfig};
//! use clgrind_plugins::PluginConfig;
//!
//! let mut context = Context::new(SimulatorConfig::serial());
//! let config = PluginConfig { data_races: true, uninitialized: true, ..PluginConfig::default() };
//! let installed = config.install(&mut context);
//! assert!(installed.race_detector.is_some());
//! ```

pub mod collector;
pub mod config;
pub mod instruction_counter;
pub mod logger;
pub mod mem_check;
pub mod race_detector;
pub mod shadow;
pub mod uninitialized;

pub use collector::DiagnosticCollector;
pub use config::{InstalledPlugins, PluginConfig};
pub use instruction_counter::{InstructionCounter, InstructionReport, MemoryTraffic};
pub use logger::Logger;
pub use mem_check::MemCheck;
pub use race_detector::{races, Access, Accessor, ByteRecord, RaceDetector};
pub use uninitialized::Uninitialized;
