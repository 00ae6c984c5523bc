//! Black-box end-to-end scenarios driven through the compiled `edgefuzz` binary, the
//! same way the upstream repo's replay/replayer binaries shell out to real processes
//! for their tests.

use std::fs;
use std::path::Path;
use std::process::Command;

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_edgefuzz")
}

fn seeds_with(dir: &Path, name: &str, contents: &[u8]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), contents).unwrap();
}

fn run_edgefuzz(args: &[&str]) -> (std::process::Output, String) {
    let out = Command::new(bin())
        .args(args)
        .output()
        .expect("failed to spawn edgefuzz binary");
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out, stderr)
}

/// Parses the final `done: N iterations, M crashes, K saved, corpus size C` summary
/// line out of the binary's (env_logger, stderr-routed) info output.
fn parse_summary(stderr: &str) -> (u64, u64, u64) {
    let line = stderr
        .lines()
        .find(|l| l.contains("done:"))
        .unwrap_or_else(|| panic!("no summary line in stderr:\n{stderr}"));
    // Slice from "done:" itself so any digits in the env_logger timestamp/level
    // prefix (e.g. "[2024-01-02T03:04:05Z INFO edgefuzz]") aren't picked up.
    let tail = &line[line.find("done:").unwrap()..];
    let nums: Vec<u64> = tail
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap())
        .collect();
    // "done: {iterations} iterations, {crashes} crashes, {saved} saved, corpus size {size}"
    (nums[0], nums[1], nums[2])
}

fn crash_files(out_dir: &Path) -> Vec<std::path::PathBuf> {
    if !out_dir.exists() {
        return Vec::new();
    }
    fs::read_dir(out_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect()
}

#[test]
fn baseline_sanity_no_crashes() {
    let tmp = tempfile::tempdir().unwrap();
    let seeds = tmp.path().join("seeds");
    let out = tmp.path().join("out");
    seeds_with(&seeds, "x", b"x");

    let (output, stderr) = run_edgefuzz(&[
        "--target", "/bin/true",
        "--seeds", seeds.to_str().unwrap(),
        "--out", out.to_str().unwrap(),
        "--iterations", "10",
    ]);
    assert!(output.status.success(), "stderr:\n{stderr}");

    let (iterations, crashes, saved) = parse_summary(&stderr);
    assert_eq!(iterations, 10);
    assert_eq!(crashes, 0);
    assert_eq!(saved, 0);
    assert!(crash_files(&out).is_empty());
}

#[test]
fn allowed_exits_produce_no_crashes() {
    let tmp = tempfile::tempdir().unwrap();
    let seeds = tmp.path().join("seeds");
    let out = tmp.path().join("out");
    seeds_with(&seeds, "x", b"x");

    let (output, stderr) = run_edgefuzz(&[
        "--target", "/bin/sh -c 'exit 2'",
        "--seeds", seeds.to_str().unwrap(),
        "--out", out.to_str().unwrap(),
        "--iterations", "5",
        "--allowed-exits", "2",
    ]);
    assert!(output.status.success(), "stderr:\n{stderr}");

    let (_, crashes, saved) = parse_summary(&stderr);
    assert_eq!(crashes, 0);
    assert_eq!(saved, 0);
}

#[test]
fn signal_crash_is_saved_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let seeds = tmp.path().join("seeds");
    let out = tmp.path().join("out");
    seeds_with(&seeds, "x", b"x");

    let (output, stderr) = run_edgefuzz(&[
        "--target", "/bin/sh -c 'kill -SEGV $$'",
        "--seeds", seeds.to_str().unwrap(),
        "--out", out.to_str().unwrap(),
        "--iterations", "3",
    ]);
    assert!(output.status.success(), "stderr:\n{stderr}");

    let (_, crashes, saved) = parse_summary(&stderr);
    assert!(crashes >= 1);
    assert_eq!(saved, 1);

    let files = crash_files(&out);
    assert_eq!(files.len(), 2, "expected one .bin and one .meta.txt: {files:?}");
    let meta = files
        .iter()
        .find(|p| p.extension().map(|e| e == "txt").unwrap_or(false))
        .expect("meta file present");
    let meta_text = fs::read_to_string(meta).unwrap();
    assert!(meta_text.contains("reason: signal:11"), "{meta_text}");
}

#[test]
fn timeout_saves_one_file_with_literal_signature() {
    let tmp = tempfile::tempdir().unwrap();
    let seeds = tmp.path().join("seeds");
    let out = tmp.path().join("out");
    seeds_with(&seeds, "x", b"x");

    let (output, stderr) = run_edgefuzz(&[
        "--target", "/bin/sh -c 'sleep 10'",
        "--seeds", seeds.to_str().unwrap(),
        "--out", out.to_str().unwrap(),
        "--iterations", "2",
        "--timeout-ms", "100",
    ]);
    assert!(output.status.success(), "stderr:\n{stderr}");

    let (_, crashes, saved) = parse_summary(&stderr);
    assert_eq!(crashes, 2);
    assert_eq!(saved, 1);

    let files = crash_files(&out);
    let meta = files
        .iter()
        .find(|p| p.extension().map(|e| e == "txt").unwrap_or(false))
        .expect("meta file present");
    let meta_text = fs::read_to_string(meta).unwrap();
    assert!(meta_text.contains("signature: timeout"), "{meta_text}");
    assert!(meta_text.contains("timed_out: true"), "{meta_text}");
}

#[test]
fn signature_dedup_across_many_iterations() {
    let tmp = tempfile::tempdir().unwrap();
    let seeds = tmp.path().join("seeds");
    let out = tmp.path().join("out");
    seeds_with(&seeds, "x", b"x");

    let (output, stderr) = run_edgefuzz(&[
        "--target", "/bin/sh -c 'exit 3'",
        "--seeds", seeds.to_str().unwrap(),
        "--out", out.to_str().unwrap(),
        "--iterations", "20",
    ]);
    assert!(output.status.success(), "stderr:\n{stderr}");

    let (_, crashes, saved) = parse_summary(&stderr);
    assert_eq!(crashes, 20);
    assert_eq!(saved, 1);
    assert_eq!(crash_files(&out).len(), 2);
}

#[test]
fn usage_error_exits_nonzero_without_crashing() {
    let out = Command::new(bin())
        .args(["--target", "", "--seeds", "/nonexistent", "--out", "/nonexistent"])
        .output()
        .expect("failed to spawn edgefuzz binary");
    assert!(!out.status.success());
    assert_eq!(out.status.code(), Some(1));
}
