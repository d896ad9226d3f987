//! End-to-end tests exercising the full pipeline on small lowered modules:
//!
//!   .dvl source -> driver info -> pairing -> lockset instrumentation ->
//!     access logging -> pair composition -> race instrumentation ->
//!     explicit-state verification
//!
//! Each test writes a module and its role file to a temp directory, runs
//! the pipeline with the explicit checker, and inspects the per-pair
//! reports and persisted artifacts.

mod common;

use common::*;
use drover_check::ExplicitChecker;
use drover_engine::{ExitOutcome, Pipeline, RaceCheckingVariant};
use tempfile::TempDir;

#[test]
fn guarded_self_pair_verifies() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(dir.path(), GUARDED_DRIVER, TWO_EP_INFO);
    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");

    assert_eq!(stats.pairs.len(), 1);
    assert_eq!(stats.pairs[0].logger, "drv_irq");
    assert_eq!(stats.pairs[0].checkers, vec!["drv_irq$2".to_string()]);
    assert_eq!(stats.pairs[0].outcome, "verified");
    assert_eq!(stats.verified, 1);
    assert!(!stats.has_race);
    assert_eq!(stats.outcome(), ExitOutcome::Done);
}

#[test]
fn unguarded_access_is_reported_racy() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(dir.path(), UNGUARDED_DRIVER, TWO_EP_INFO);
    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");

    assert_eq!(stats.pairs.len(), 1);
    assert_eq!(stats.pairs[0].outcome, "racy");
    assert!(stats.has_race);
    assert_eq!(stats.racy, 1);
    assert_eq!(stats.outcome(), ExitOutcome::LocksetAnalysisError);
    assert!(stats.pairs[0]
        .races
        .iter()
        .any(|race| race.region == "$M.counter" && race.access == "write"));
}

#[test]
fn unguarded_access_is_racy_under_the_normal_variant_too() {
    let dir = TempDir::new().expect("temp dir");
    let mut config = config_for(dir.path(), UNGUARDED_DRIVER, TWO_EP_INFO);
    config.race_checking = RaceCheckingVariant::Normal;
    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");

    assert_eq!(stats.pairs.len(), 1);
    assert_eq!(stats.pairs[0].outcome, "racy");
    assert!(stats.pairs[0]
        .races
        .iter()
        .any(|race| race.region == "$M.counter"));
}

#[test]
fn only_the_conflicting_pair_is_flagged() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(dir.path(), MIXED_DRIVER, THREE_EP_INFO);
    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");

    // Triangular pairing: irq/irq, irq/read, read/read.
    assert_eq!(stats.pairs.len(), 3);
    assert_eq!(stats.verified, 2);
    assert_eq!(stats.racy, 1);
    for report in &stats.pairs {
        let cross = report.checkers.contains(&"drv_read".to_string())
            || report.logger == "drv_read" && report.checkers.contains(&"drv_irq".to_string());
        if cross {
            assert_eq!(report.outcome, "racy", "pair {}", report.pair);
            assert!(report
                .races
                .iter()
                .any(|race| race.region == "$M.counter"));
        } else {
            assert_eq!(report.outcome, "verified", "pair {}", report.pair);
        }
    }
    assert_eq!(stats.outcome(), ExitOutcome::LocksetAnalysisError);
}

#[test]
fn concurrent_readers_do_not_race() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(dir.path(), READ_ONLY_DRIVER, THREE_EP_INFO);
    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");

    assert_eq!(stats.pairs.len(), 3);
    assert_eq!(stats.verified, 3);
    assert!(!stats.has_race);
    assert_eq!(stats.outcome(), ExitOutcome::Done);
}

#[test]
fn stage_artifacts_are_persisted() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(dir.path(), GUARDED_DRIVER, TWO_EP_INFO);
    let out_dir = config.out_dir.clone();
    Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");

    assert!(out_dir.join("driver_instrumented.dvl").exists());
    assert!(out_dir.join("check_drv_irq_drv_irq$2.dvl").exists());
    assert!(out_dir.join("check_racy_drv_irq_drv_irq$2.dvl").exists());

    // Every persisted artifact parses back.
    for file in [
        "driver_instrumented.dvl",
        "check_drv_irq_drv_irq$2.dvl",
        "check_racy_drv_irq_drv_irq$2.dvl",
    ] {
        let text = std::fs::read_to_string(out_dir.join(file)).expect("read artifact");
        drover_ir::parse(&text, file).expect("artifact re-parses");
    }
}

#[test]
fn inferred_summaries_are_picked_up_on_the_next_run() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(dir.path(), GUARDED_DRIVER, TWO_EP_INFO);
    let out_dir = config.out_dir.clone();
    Pipeline::new(config.clone())
        .run(&ExplicitChecker)
        .expect("first run");

    // Promote the instrumented artifact to a summarised one covering the
    // self-pair participants.
    let instrumented =
        std::fs::read_to_string(out_dir.join("driver_instrumented.dvl")).expect("read artifact");
    std::fs::write(out_dir.join("driver$summarised.dvl"), instrumented).expect("write summarised");
    std::fs::write(
        out_dir.join("driver.summaries"),
        "<available_summaries>\ndrv_irq\ndrv_irq$2\n</>\n",
    )
    .expect("write index");

    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("second run");
    assert_eq!(stats.verified, 1);
    assert_eq!(stats.outcome(), ExitOutcome::Done);
}

#[test]
fn skip_inference_ignores_a_stale_summary_index() {
    let dir = TempDir::new().expect("temp dir");
    let mut config = config_for(dir.path(), GUARDED_DRIVER, TWO_EP_INFO);
    config.skip_inference = true;
    let out_dir = config.out_dir.clone();
    std::fs::create_dir_all(&out_dir).expect("out dir");
    std::fs::write(out_dir.join("driver$summarised.dvl"), "not a module").expect("write stale");
    std::fs::write(out_dir.join("driver.summaries"), "also stale").expect("write stale index");

    let stats = Pipeline::new(config)
        .run(&ExplicitChecker)
        .expect("pipeline run");
    assert_eq!(stats.outcome(), ExitOutcome::Done);
}
