mod cli;

use std::path::PathBuf;

use clap::Parser;

use edgefuzz::corpus::Corpus;
use edgefuzz::mutator::Dict;
use edgefuzz::orchestrator::{self, RunConfig};
use edgefuzz::util::{seed_from_os, split_cmdline};
use edgefuzz::Error;

fn main() {
    let cli = cli::Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("edgefuzz: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: cli::Cli) -> Result<(), Error> {
    let argv_template = split_cmdline(&cli.target);
    if argv_template.is_empty() {
        return Err(Error::Config("--target must not be empty".to_string()));
    }
    preflight_target(&argv_template[0])?;

    let max_size = cli.max_size.max(1);
    let threads = cli.threads.max(1);
    let seed = cli.seed.unwrap_or_else(seed_from_os);

    std::fs::create_dir_all(&cli.out)?;

    let corpus = Corpus::new(seed, max_size);
    let loaded = corpus
        .load_dir(&cli.seeds)
        .map_err(|e| Error::Config(format!("failed to load seeds from {:?}: {e}", cli.seeds)))?;
    log::info!("loaded {loaded} seed(s) from {:?}", cli.seeds);

    let dict = match &cli.dict {
        Some(path) => Dict::load(path).unwrap_or_else(|e| {
            log::warn!("failed to load dictionary {path:?}: {e}, falling back to built-in");
            Dict::builtin()
        }),
        None => Dict::builtin(),
    };

    let run_cfg = RunConfig {
        argv_template,
        out_dir: cli.out.clone(),
        iterations: cli.iterations,
        threads,
        timeout_ms: cli.timeout_ms,
        mem_mb: cli.mem_mb,
        max_size,
        seed,
        allowed_exits: cli.allowed_exits.clone(),
    };

    log::info!(
        "starting run: target={:?} threads={} iterations={} timeout_ms={} seed={}",
        cli.target,
        threads,
        cli.iterations,
        cli.timeout_ms,
        seed
    );

    let summary = orchestrator::run(run_cfg, dict, corpus);

    log::info!(
        "done: {} iterations, {} crashes, {} saved, corpus size {}",
        summary.iterations_done,
        summary.crashes,
        summary.saved,
        summary.corpus_size,
    );

    Ok(())
}

/// Resolves `program` via `PATH` (if it has no path separator) or as a relative/absolute
/// path, and verifies it is executable. Mirrors the original implementation's
/// `preflight_target` configuration-time check.
fn preflight_target(program: &str) -> Result<(), Error> {
    let candidate: PathBuf = if program.contains('/') {
        PathBuf::from(program)
    } else {
        match which(program) {
            Some(p) => p,
            None => {
                return Err(Error::Config(format!(
                    "target {program:?} not found on PATH"
                )))
            }
        }
    };

    if !candidate.exists() {
        return Err(Error::Config(format!(
            "target {candidate:?} does not exist"
        )));
    }
    match nix::unistd::access(&candidate, nix::unistd::AccessFlags::X_OK) {
        Ok(()) => Ok(()),
        Err(e) => Err(Error::Config(format!(
            "target {candidate:?} is not executable: {e}"
        ))),
    }
}

fn which(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
