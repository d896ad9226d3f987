//! Black-box tests driving the `drover` binary on small lowered modules.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const GUARDED_DRIVER: &str = "\
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

const UNGUARDED_DRIVER: &str = "\
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

const INFO: &str = "<test_module>\nprobe::drv_init\nirq::drv_irq\n</>\n";

fn write_module(dir: &Path, source: &str) -> (PathBuf, PathBuf) {
    let source_path = dir.join("driver.dvl");
    let info_path = dir.join("driver.info");
    fs::write(&source_path, source).expect("write module");
    fs::write(&info_path, INFO).expect("write info");
    (source_path, info_path)
}

fn drover() -> Command {
    Command::new(env!("CARGO_BIN_EXE_drover"))
}

#[test]
fn guarded_module_exits_zero() {
    let dir = TempDir::new().expect("temp dir");
    let (source, info) = write_module(dir.path(), GUARDED_DRIVER);
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .output()
        .expect("run drover");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("drv_irq_drv_irq$2: verified"), "stdout: {stdout}");
    assert!(stdout.contains("verified: 1 racy: 0"), "stdout: {stdout}");
}

#[test]
fn racy_module_exits_with_the_lockset_analysis_code() {
    let dir = TempDir::new().expect("temp dir");
    let (source, info) = write_module(dir.path(), UNGUARDED_DRIVER);
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .output()
        .expect("run drover");
    assert_eq!(output.status.code(), Some(4));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("racy"), "stdout: {stdout}");
    assert!(
        stdout.contains("potential write race on $M.counter"),
        "stdout: {stdout}"
    );
}

#[test]
fn unparsable_module_exits_with_the_parsing_code() {
    let dir = TempDir::new().expect("temp dir");
    let source = dir.path().join("driver.dvl");
    let info = dir.path().join("driver.info");
    fs::write(&source, "implementation {").expect("write module");
    fs::write(&info, INFO).expect("write info");
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .output()
        .expect("run drover");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_probe_role_is_a_fatal_configuration_error() {
    let dir = TempDir::new().expect("temp dir");
    let source = dir.path().join("driver.dvl");
    let info = dir.path().join("driver.info");
    fs::write(&source, GUARDED_DRIVER).expect("write module");
    fs::write(&info, "<test_module>\nirq::drv_irq\n</>\n").expect("write info");
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .output()
        .expect("run drover");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn wrong_source_extension_is_a_fatal_error() {
    let dir = TempDir::new().expect("temp dir");
    let source = dir.path().join("driver.c");
    let info = dir.path().join("driver.info");
    fs::write(&source, GUARDED_DRIVER).expect("write module");
    fs::write(&info, INFO).expect("write info");
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .output()
        .expect("run drover");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn print_pairs_lists_the_pairing() {
    let dir = TempDir::new().expect("temp dir");
    let (source, info) = write_module(dir.path(), GUARDED_DRIVER);
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .arg("--print-pairs")
        .output()
        .expect("run drover");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Entry Point: drv_irq"), "stdout: {stdout}");
}

#[test]
fn emit_json_writes_the_run_statistics() {
    let dir = TempDir::new().expect("temp dir");
    let (source, info) = write_module(dir.path(), UNGUARDED_DRIVER);
    let report = dir.path().join("report.json");
    let output = drover()
        .arg(&source)
        .arg("--driver-info")
        .arg(&info)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .arg("--emit-json")
        .arg(&report)
        .output()
        .expect("run drover");
    assert_eq!(output.status.code(), Some(4));
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).expect("read report"))
            .expect("parse report");
    assert_eq!(json["has_race"], serde_json::Value::Bool(true));
    assert_eq!(json["pairs"][0]["outcome"], "racy");
}
