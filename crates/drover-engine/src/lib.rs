//! Drover analysis and instrumentation engine.
//!
//! The engine takes a driver module lowered to the drover verification
//! language plus a driver role file, and runs the static lockset pipeline:
//!
//! 1. shared-memory region discovery and pointer alias resolution,
//! 2. entry-point modelling and pairing,
//! 3. lock abstraction (canonical lock identities across entry points),
//! 4. per-entry-point lockset instrumentation,
//! 5. pairwise region composition,
//! 6. race (watchdog) instrumentation,
//! 7. model cleaning between stages,
//! 8. verification-backend dispatch and outcome accumulation.

pub mod alias;
pub mod cleaner;
pub mod compose;
pub mod context;
pub mod driver;
pub mod lockset;
pub mod locks;
pub mod pairing;
pub mod pipeline;
pub mod race;
pub mod region;
pub mod shared;

pub use context::AnalysisContext;
pub use driver::DeviceDriver;
pub use pairing::{EntryPointPair, PairingMethod};
pub use pipeline::{ExitOutcome, Pipeline, PipelineConfig, PipelineError, PipelineStatistics};
pub use race::RaceCheckingVariant;
