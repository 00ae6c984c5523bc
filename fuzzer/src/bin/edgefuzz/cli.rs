//! The command line interface of the fuzzer.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Coverage-guided, mutation-based fuzzer for native executables")]
pub struct Cli {
    #[arg(
        help = "Target command-line template, POSIX-quoted; use @@ for a file placeholder and {stdin} to stream via stdin",
        long = "target",
        required = true
    )]
    pub target: String,

    #[arg(help = "Seed corpus directory", long = "seeds", required = true)]
    pub seeds: PathBuf,

    #[arg(help = "Output directory for crashes", long = "out", required = true)]
    pub out: PathBuf,

    #[arg(long = "iterations", default_value = "10000")]
    pub iterations: u64,

    #[arg(long = "threads", default_value = "1")]
    pub threads: u64,

    #[arg(long = "timeout-ms", default_value = "1000")]
    pub timeout_ms: u64,

    #[arg(long = "mem-mb", default_value = "0")]
    pub mem_mb: u64,

    #[arg(long = "max-size", default_value = "4096")]
    pub max_size: usize,

    #[arg(help = "Dictionary file: one token per line", long = "dict")]
    pub dict: Option<PathBuf>,

    #[arg(help = "RNG seed; default derives from OS entropy", long = "seed")]
    pub seed: Option<u64>,

    #[arg(
        help = "Comma-separated exit codes treated as non-crashes",
        long = "allowed-exits",
        value_delimiter = ','
    )]
    pub allowed_exits: Vec<i32>,

    #[arg(help = "Raise log verbosity to debug", short = 'v', long = "verbose")]
    pub verbose: bool,
}
