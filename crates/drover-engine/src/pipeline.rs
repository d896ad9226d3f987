//! Pipeline orchestration.
//!
//! Drives the full analysis for one driver module: parse, pair, instrument,
//! compose, race-check, and accumulate per-pair outcomes. Intermediate
//! artifacts are persisted to the output directory after each stage
//! (`<stem>_instrumented.dvl`, `check_<A>_<B>.dvl`, `check_racy_<A>_<B>.dvl`)
//! so stages can be inspected and re-run, and an externally produced
//! `<stem>$summarised.dvl` is picked up through the summary index file.

use crate::cleaner;
use crate::compose::{self, ComposeError};
use crate::context::AnalysisContext;
use crate::driver::{DeviceDriver, DriverInfoError};
use crate::lockset::{self, LocksetError};
use crate::pairing::{self, EntryPointPair, PairingMethod};
use crate::race::{self, RaceCheckingVariant};
use drover_check::{CheckError, CheckLimits, Checker, RaceError, VerificationOutcome};
use drover_ir::{printer, Program};
use indexmap::IndexSet;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] drover_ir::ParseError),
    #[error("driver info error: {0}")]
    DriverInfo(#[from] DriverInfoError),
    #[error("lockset instrumentation error: {0}")]
    Lockset(#[from] LocksetError),
    #[error("composition error: {0}")]
    Compose(#[from] ComposeError),
    #[error("verification backend error: {0}")]
    Check(#[from] CheckError),
    #[error("summary index '{path}' is missing its '</>' end marker")]
    MalformedSummaryIndex { path: PathBuf },
}

/// Final process outcome, in the order of the exit codes the tool reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Done,
    FatalError,
    ParsingError,
    InstrumentationError,
    LocksetAnalysisError,
}

impl ExitOutcome {
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Done => 0,
            ExitOutcome::FatalError => 1,
            ExitOutcome::ParsingError => 2,
            ExitOutcome::InstrumentationError => 3,
            ExitOutcome::LocksetAnalysisError => 4,
        }
    }
}

impl PipelineError {
    pub fn outcome(&self) -> ExitOutcome {
        match self {
            // An absent probe role is a configuration error, not a syntax
            // problem in the info file.
            PipelineError::DriverInfo(DriverInfoError::MissingProbeRole) => {
                ExitOutcome::FatalError
            }
            PipelineError::Parse(_)
            | PipelineError::DriverInfo(_)
            | PipelineError::MalformedSummaryIndex { .. } => ExitOutcome::ParsingError,
            PipelineError::Lockset(_) | PipelineError::Compose(_) => {
                ExitOutcome::InstrumentationError
            }
            PipelineError::Io(_) | PipelineError::Check(_) => ExitOutcome::FatalError,
        }
    }
}

/// Configuration of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lowered driver module.
    pub source: PathBuf,
    /// Driver role file.
    pub driver_info: PathBuf,
    /// Directory receiving intermediate artifacts.
    pub out_dir: PathBuf,
    pub pairing: PairingMethod,
    pub race_checking: RaceCheckingVariant,
    /// Ignore the summary index even when present.
    pub skip_inference: bool,
    /// Log the wall-clock time of each pass.
    pub time_passes: bool,
    pub limits: CheckLimits,
}

/// Verification report for one entry-point pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub pair: String,
    pub logger: String,
    pub checkers: Vec<String>,
    pub outcome: String,
    pub races: Vec<RaceError>,
    pub duration_ms: u128,
}

/// Accumulated run statistics, serializable for `--emit-json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatistics {
    pub pairs: Vec<PairReport>,
    pub verified: usize,
    pub racy: usize,
    pub inconclusive: usize,
    pub has_race: bool,
}

impl PipelineStatistics {
    fn record(&mut self, report: PairReport) {
        match report.outcome.as_str() {
            "verified" => self.verified += 1,
            "racy" => {
                self.racy += 1;
                self.has_race = true;
            }
            _ => self.inconclusive += 1,
        }
        self.pairs.push(report);
    }

    pub fn outcome(&self) -> ExitOutcome {
        if self.verified == self.pairs.len() {
            ExitOutcome::Done
        } else {
            ExitOutcome::LocksetAnalysisError
        }
    }
}

fn outcome_tag(outcome: &VerificationOutcome) -> &'static str {
    match outcome {
        VerificationOutcome::Verified => "verified",
        VerificationOutcome::Errors(_) => "racy",
        VerificationOutcome::TimedOut => "timed-out",
        VerificationOutcome::OutOfMemory => "out-of-memory",
        VerificationOutcome::Inconclusive => "inconclusive",
    }
}

/// Parse a summary index file: entry-point names between an
/// `<available_summaries>` header and a `</>` footer.
pub fn parse_summary_index(text: &str, path: &Path) -> Result<IndexSet<String>, PipelineError> {
    let mut names = IndexSet::new();
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("<available_summaries>") {
        return Err(PipelineError::MalformedSummaryIndex {
            path: path.to_path_buf(),
        });
    }
    for line in lines {
        if line == "</>" {
            return Ok(names);
        }
        names.insert(line.to_string());
    }
    Err(PipelineError::MalformedSummaryIndex {
        path: path.to_path_buf(),
    })
}

/// Render a summary index file.
pub fn render_summary_index(names: &IndexSet<String>) -> String {
    let mut out = String::from("<available_summaries>\n");
    for name in names {
        out.push_str(name);
        out.push('\n');
    }
    out.push_str("</>\n");
    out
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn timed<T>(&self, pass: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let value = f();
        if self.config.time_passes {
            info!(pass, elapsed_ms = start.elapsed().as_millis() as u64, "pass finished");
        }
        value
    }

    fn stem(&self) -> String {
        self.config
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "driver".to_string())
    }

    fn persist(&self, file: &str, program: &Program) -> Result<(), PipelineError> {
        let path = self.config.out_dir.join(file);
        fs::write(path, printer::print_program(program))?;
        Ok(())
    }

    /// Pick the upstream artifact for one pair: the summarised program when
    /// every participant has an inferred summary, the instrumented one
    /// otherwise.
    fn base_for_pair<'a>(
        &self,
        pair: &EntryPointPair,
        instrumented: &'a Program,
        summarised: Option<&'a (IndexSet<String>, Program)>,
    ) -> &'a Program {
        if let Some((index, program)) = summarised {
            let covered = index.contains(&pair.logger)
                && pair.checkers.iter().all(|c| index.contains(c));
            if covered {
                return program;
            }
        }
        instrumented
    }

    /// Run the whole pipeline with the given verification backend.
    pub fn run(&self, checker: &dyn Checker) -> Result<PipelineStatistics, PipelineError> {
        fs::create_dir_all(&self.config.out_dir)?;
        let stem = self.stem();

        let source = fs::read_to_string(&self.config.source)?;
        let mut program = self.timed("parse", || {
            drover_ir::parse(&source, &self.config.source.to_string_lossy())
        })?;
        let info = fs::read_to_string(&self.config.driver_info)?;
        let mut driver = DeviceDriver::parse(&info)?;
        info!(
            entry_points = driver.entry_points.len(),
            source = %self.config.source.display(),
            "loaded driver module"
        );

        let mut pairs = self.timed("pairing", || {
            pairing::generate_pairs(&driver, self.config.pairing)
        });
        // Self-pairs become twin entry points so each side owns its state.
        for pair in &mut pairs {
            for checker_ep in &mut pair.checkers {
                if *checker_ep == pair.logger {
                    *checker_ep =
                        compose::duplicate_entry_point(&mut program, &mut driver, &pair.logger)?;
                }
            }
        }

        let ctx = AnalysisContext::new(&program, driver.clone());
        info!(locks = ctx.locks.len(), regions = ctx.memory_regions.len(), "analysis context built");

        self.timed("lockset-instrumentation", || {
            lockset::instrument(&mut program, &ctx)
        })?;
        self.timed("access-instrumentation", || {
            race::instrument_accesses(&mut program, &ctx)
        });
        cleaner::shrink_access_maps(&mut driver, &program);
        self.persist(&format!("{stem}_instrumented.dvl"), &program)?;

        let summarised = self.load_summaries(&stem)?;

        let mut stats = PipelineStatistics::default();
        for pair in &pairs {
            let tag = pair.artifact_tag();
            let mut pair_program = self
                .base_for_pair(pair, &program, summarised.as_ref())
                .clone();

            let composite = self.timed("composition", || {
                compose::compose_pair(&mut pair_program, pair, driver.init_entry_point())
            })?;
            race::rewrite_checker_calls(&mut pair_program, &pair.checkers);
            cleaner::clean(&mut pair_program, std::slice::from_ref(&composite));
            self.persist(&format!("check_{tag}.dvl"), &pair_program)?;

            self.timed("race-instrumentation", || {
                race::instrument_pair(
                    &mut pair_program,
                    self.config.race_checking,
                    &pair.logger,
                    &pair.checkers,
                    &composite,
                )
            });
            cleaner::clean(&mut pair_program, std::slice::from_ref(&composite));
            self.persist(&format!("check_racy_{tag}.dvl"), &pair_program)?;

            let start = Instant::now();
            let outcome = self.timed("verification", || {
                checker.check(&pair_program, &composite, &self.config.limits)
            })?;
            let races = match &outcome {
                VerificationOutcome::Errors(races) => races.clone(),
                _ => Vec::new(),
            };
            info!(pair = %tag, outcome = outcome_tag(&outcome), races = races.len(), "pair checked");
            stats.record(PairReport {
                pair: tag,
                logger: pair.logger.clone(),
                checkers: pair.checkers.clone(),
                outcome: outcome_tag(&outcome).to_string(),
                races,
                duration_ms: start.elapsed().as_millis(),
            });
        }

        info!(
            verified = stats.verified,
            racy = stats.racy,
            inconclusive = stats.inconclusive,
            "pipeline finished"
        );
        Ok(stats)
    }

    fn load_summaries(
        &self,
        stem: &str,
    ) -> Result<Option<(IndexSet<String>, Program)>, PipelineError> {
        if self.config.skip_inference {
            return Ok(None);
        }
        let index_path = self.config.out_dir.join(format!("{stem}.summaries"));
        let program_path = self.config.out_dir.join(format!("{stem}$summarised.dvl"));
        if !index_path.exists() || !program_path.exists() {
            return Ok(None);
        }
        let index = parse_summary_index(&fs::read_to_string(&index_path)?, &index_path)?;
        let text = fs::read_to_string(&program_path)?;
        match drover_ir::parse(&text, &program_path.to_string_lossy()) {
            Ok(program) => {
                info!(summaries = index.len(), "using inferred summaries");
                Ok(Some((index, program)))
            }
            Err(err) => {
                warn!(error = %err, "ignoring unparsable summarised artifact");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_index_round_trips() {
        let mut names = IndexSet::new();
        names.insert("drv_irq".to_string());
        names.insert("drv_read".to_string());
        let text = render_summary_index(&names);
        let parsed = parse_summary_index(&text, Path::new("t.summaries")).unwrap();
        assert_eq!(parsed, names);
    }

    #[test]
    fn summary_index_requires_markers() {
        let err = parse_summary_index("drv_irq\n", Path::new("t.summaries"));
        assert!(matches!(
            err,
            Err(PipelineError::MalformedSummaryIndex { .. })
        ));
        let err = parse_summary_index("<available_summaries>\ndrv_irq\n", Path::new("t"));
        assert!(matches!(
            err,
            Err(PipelineError::MalformedSummaryIndex { .. })
        ));
    }

    #[test]
    fn exit_codes_follow_the_documented_order() {
        assert_eq!(ExitOutcome::Done.code(), 0);
        assert_eq!(ExitOutcome::FatalError.code(), 1);
        assert_eq!(ExitOutcome::ParsingError.code(), 2);
        assert_eq!(ExitOutcome::InstrumentationError.code(), 3);
        assert_eq!(ExitOutcome::LocksetAnalysisError.code(), 4);
    }

    #[test]
    fn missing_probe_role_is_fatal_not_a_parse_error() {
        let err = PipelineError::DriverInfo(DriverInfoError::MissingProbeRole);
        assert_eq!(err.outcome(), ExitOutcome::FatalError);
        let err = PipelineError::DriverInfo(DriverInfoError::MalformedLine {
            line: "irq".into(),
        });
        assert_eq!(err.outcome(), ExitOutcome::ParsingError);
    }

    #[test]
    fn statistics_classify_outcomes() {
        let mut stats = PipelineStatistics::default();
        stats.record(PairReport {
            pair: "a_b".into(),
            logger: "a".into(),
            checkers: vec!["b".into()],
            outcome: "verified".into(),
            races: Vec::new(),
            duration_ms: 1,
        });
        assert_eq!(stats.outcome(), ExitOutcome::Done);
        stats.record(PairReport {
            pair: "a_c".into(),
            logger: "a".into(),
            checkers: vec!["c".into()],
            outcome: "racy".into(),
            races: Vec::new(),
            duration_ms: 1,
        });
        assert!(stats.has_race);
        assert_eq!(stats.outcome(), ExitOutcome::LocksetAnalysisError);
    }
}
