#![allow(dead_code)]

use drover_check::CheckLimits;
use drover_engine::{PairingMethod, PipelineConfig, RaceCheckingVariant};
use std::fs;
use std::path::Path;

/// Lowered module whose interrupt handler guards the shared counter with
/// the mutex the init routine registers.
pub const GUARDED_DRIVER: &str = "\
var $M.counter: [int]int;\n\
\n\
implementation drv_init(dev: int)\n\
{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_init(l);\n\
  return;\n\
}\n\
\n\
implementation drv_irq(dev: int)\n\
{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_lock(l);\n\
  $M.counter[dev] := $M.counter[dev] + 1;\n\
  call mutex_unlock(l);\n\
  return;\n\
}\n";

/// The same module with the locking dropped from the handler.
pub const UNGUARDED_DRIVER: &str = "\
var $M.counter: [int]int;\n\
\n\
implementation drv_init(dev: int)\n\
{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_init(l);\n\
  return;\n\
}\n\
\n\
implementation drv_irq(dev: int)\n\
{\n\
$entry:\n\
  $M.counter[dev] := $M.counter[dev] + 1;\n\
  return;\n\
}\n";

/// Three entry points: a guarded writer, and a reader that forgot the lock.
pub const MIXED_DRIVER: &str = "\
var $M.counter: [int]int;\n\
\n\
implementation drv_init(dev: int)\n\
{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_init(l);\n\
  return;\n\
}\n\
\n\
implementation drv_irq(dev: int)\n\
{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_lock(l);\n\
  $M.counter[dev] := $M.counter[dev] + 1;\n\
  call mutex_unlock(l);\n\
  return;\n\
}\n\
\n\
implementation drv_read(dev: int)\n\
{\n\
var v: int;\n\
$entry:\n\
  v := $M.counter[dev];\n\
  return;\n\
}\n";

/// Two entry points that only ever read the shared counter.
pub const READ_ONLY_DRIVER: &str = "\
var $M.counter: [int]int;\n\
\n\
implementation drv_init(dev: int)\n\
{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_init(l);\n\
  return;\n\
}\n\
\n\
implementation drv_irq(dev: int)\n\
{\n\
var v: int;\n\
$entry:\n\
  v := $M.counter[dev];\n\
  return;\n\
}\n\
\n\
implementation drv_read(dev: int)\n\
{\n\
var v: int;\n\
$entry:\n\
  v := $M.counter[dev];\n\
  return;\n\
}\n";

pub const TWO_EP_INFO: &str = "<test_module>\nprobe::drv_init\nirq::drv_irq\n</>\n";
pub const THREE_EP_INFO: &str =
    "<test_module>\nprobe::drv_init\nirq::drv_irq\nread::drv_read\n</>\n";

/// Write a module and its role file into `dir` and return a pipeline
/// configuration pointing at them.
pub fn config_for(dir: &Path, source: &str, info: &str) -> PipelineConfig {
    let source_path = dir.join("driver.dvl");
    let info_path = dir.join("driver.info");
    fs::write(&source_path, source).expect("write driver module");
    fs::write(&info_path, info).expect("write driver info");
    PipelineConfig {
        source: source_path,
        driver_info: info_path,
        out_dir: dir.join("out"),
        pairing: PairingMethod::Triangular,
        race_checking: RaceCheckingVariant::Watchdog,
        skip_inference: false,
        time_passes: false,
        limits: CheckLimits::default(),
    }
}
