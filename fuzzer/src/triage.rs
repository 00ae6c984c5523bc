//! Crash classification and de-duplication signatures.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::executor::ExecResult;

/// Classification of one execution outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashInfo {
    pub crashed: bool,
    pub reason: String,
    pub signature: String,
}

const ASAN_ERROR_MARKER: &str = "ERROR: AddressSanitizer:";
const ASAN_DEADLY_MARKER: &str = "AddressSanitizer:DEADLYSIGNAL";

const FRAME_EXCLUDE: &[&str] = &[
    "libasan",
    "__asan",
    "asan_",
    "__interceptor",
    "libc.so",
    "libstdc++",
    "libgcc",
    "ld-linux",
    "linux-vdso",
    "libpthread",
    "start_thread",
];

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*#\d+\s+.*").expect("static frame regex is valid"))
}

fn pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"==\d+==").expect("static pid regex is valid"))
}

fn hex_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("static hex regex is valid"))
}

fn bare_hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[0-9a-fA-F]{8,}\b").expect("static bare-hex regex is valid"))
}

fn path_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([./][\w./-]+):(\d+)\b").expect("static path:line regex is valid")
    })
}

/// Classifies an execution outcome and, when it represents a crash, computes a stable
/// de-duplication signature. Pure: identical inputs always yield identical output.
pub fn analyze_and_sig(
    exit_code: i32,
    term_signal: i32,
    timed_out: bool,
    stdout: &[u8],
    stderr: &[u8],
    allowed_exits: &[i32],
) -> CrashInfo {
    if timed_out {
        return CrashInfo {
            crashed: true,
            reason: "timeout".to_string(),
            signature: "timeout".to_string(),
        };
    }

    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    let combined = format!("{out}\n{err}");

    let exec_failed = exit_code == 127 && err.contains("execvp:");
    let runner_error = exit_code < 0;
    if exec_failed || runner_error {
        return CrashInfo {
            crashed: false,
            reason: if exec_failed { "execvp" } else { "runner" }.to_string(),
            signature: String::new(),
        };
    }

    if term_signal != 0 {
        let frames = extract_frames(&combined);
        return CrashInfo {
            crashed: true,
            reason: format!("signal:{term_signal}"),
            signature: hash_signature(&format!("sig|{term_signal}|{}", frames.join(" ; "))),
        };
    }

    if let Some(kind) = asan_kind(&combined) {
        let frames = extract_frames(&combined);
        return CrashInfo {
            crashed: true,
            reason: "asan".to_string(),
            signature: hash_signature(&format!("asan|{kind}|{}", frames.join(" ; "))),
        };
    }

    if exit_code != 0 && !allowed_exits.contains(&exit_code) {
        return CrashInfo {
            crashed: true,
            reason: format!("exit:{exit_code}"),
            signature: hash_signature(&format!("rc|{exit_code}")),
        };
    }

    CrashInfo {
        crashed: false,
        reason: String::new(),
        signature: String::new(),
    }
}

/// Extracts the sanitizer-kind substring following `"AddressSanitizer:"` on the first
/// matching line, trying the `ERROR:` marker before the `DEADLYSIGNAL` marker.
fn asan_kind(combined: &str) -> Option<String> {
    for marker in [ASAN_ERROR_MARKER, ASAN_DEADLY_MARKER] {
        if let Some(line) = first_line_containing(combined, marker) {
            if let Some(idx) = line.find("AddressSanitizer:") {
                let rest = &line[idx + "AddressSanitizer:".len()..];
                let kind = rest.split_whitespace().next().unwrap_or("").trim_matches(':');
                if !kind.is_empty() {
                    return Some(kind.to_string());
                }
            }
            return Some(String::new());
        }
    }
    None
}

fn first_line_containing<'a>(hay: &'a str, needle: &str) -> Option<&'a str> {
    let pos = hay.find(needle)?;
    let end = hay[pos..].find('\n').map(|i| pos + i).unwrap_or(hay.len());
    Some(hay[pos..end].trim())
}

/// Up to the first three stack-frame lines (`^\s*#\d+\s+.*`), excluding known
/// sanitizer/runtime internals, each normalized to strip PIDs, pointers, and line
/// numbers that vary across otherwise-identical runs.
fn extract_frames(combined: &str) -> Vec<String> {
    let mut frames = Vec::new();
    for line in combined.lines() {
        if !frame_re().is_match(line) {
            continue;
        }
        if FRAME_EXCLUDE.iter().any(|needle| line.contains(needle)) {
            continue;
        }
        frames.push(normalize_frame(line));
        if frames.len() == 3 {
            break;
        }
    }
    frames
}

fn normalize_frame(line: &str) -> String {
    let s = pid_re().replace_all(line, "==PID==");
    let s = hex_literal_re().replace_all(&s, "0xX");
    let s = bare_hex_re().replace_all(&s, "HEX");
    let s = path_line_re().replace_all(&s, |caps: &regex::Captures| {
        let path = &caps[1];
        let base = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        format!("{base}:*")
    });
    s.trim().to_string()
}

fn hash_signature(composite: &str) -> String {
    let mut hasher = DefaultHasher::new();
    composite.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_takes_priority() {
        let ci = analyze_and_sig(0, 0, true, b"", b"", &[]);
        assert!(ci.crashed);
        assert_eq!(ci.reason, "timeout");
        assert_eq!(ci.signature, "timeout");
    }

    #[test]
    fn runner_failure_is_not_a_crash() {
        let ci = analyze_and_sig(-1, 0, false, b"", b"", &[]);
        assert!(!ci.crashed);
        assert_eq!(ci.reason, "runner");
        assert!(ci.signature.is_empty());
    }

    #[test]
    fn execvp_failure_is_not_a_crash() {
        let ci = analyze_and_sig(127, 0, false, b"", b"execvp: No such file or directory", &[]);
        assert!(!ci.crashed);
        assert_eq!(ci.reason, "execvp");
    }

    #[test]
    fn signal_crash_is_classified() {
        let ci = analyze_and_sig(0, 11, false, b"", b"", &[]);
        assert!(ci.crashed);
        assert_eq!(ci.reason, "signal:11");
        assert!(!ci.signature.is_empty());
    }

    #[test]
    fn asan_crash_is_classified() {
        let out = b"ERROR: AddressSanitizer: heap-buffer-overflow on address 0xabc\n    #0 0xdeadbeef in foo /src/foo.c:42\n";
        let ci = analyze_and_sig(1, 0, false, out, b"", &[]);
        assert!(ci.crashed);
        assert_eq!(ci.reason, "asan");
    }

    #[test]
    fn allowed_exit_is_not_a_crash() {
        let ci = analyze_and_sig(2, 0, false, b"", b"", &[2, 3]);
        assert!(!ci.crashed);
    }

    #[test]
    fn disallowed_nonzero_exit_is_a_crash() {
        let ci = analyze_and_sig(3, 0, false, b"", b"", &[]);
        assert!(ci.crashed);
        assert_eq!(ci.reason, "exit:3");
        assert_eq!(ci.signature, hash_signature("rc|3"));
    }

    #[test]
    fn clean_exit_is_not_a_crash() {
        let ci = analyze_and_sig(0, 0, false, b"ok", b"", &[]);
        assert!(!ci.crashed);
        assert!(ci.signature.is_empty());
    }

    #[test]
    fn analyze_and_sig_is_pure() {
        let a = analyze_and_sig(3, 0, false, b"out", b"err", &[1, 2]);
        let b = analyze_and_sig(3, 0, false, b"out", b"err", &[1, 2]);
        assert_eq!(a, b);
    }

    #[test]
    fn asan_signature_ignores_pid_and_pointer_noise() {
        let make = |pid: u32, ptr: &str| {
            format!(
                "=={pid}==ERROR: AddressSanitizer: heap-use-after-free\n    #0 {ptr} in bar /work/src/bar.c:17\n"
            )
        };
        let a = analyze_and_sig(1, 0, false, make(111, "0x602000000010").as_bytes(), b"", &[]);
        let b = analyze_and_sig(1, 0, false, make(222, "0x7fabc0001234").as_bytes(), b"", &[]);
        assert_eq!(a.signature, b.signature, "normalization should make these equal");
    }

    #[test]
    fn exit_code_signature_is_stable_across_runs() {
        let a = hash_signature("rc|5");
        let b = hash_signature("rc|5");
        assert_eq!(a, b);
    }
}
