use fuzzherd::config::{Config, Strategy, OPTIONS_ENV};
use std::{env, path::PathBuf, process::exit};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "fuzzherd", about = "Supervise long-running fuzzers for many targets.")]
struct Settings {
    /// Config file in toml format, defaults are used for missing keys.
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// JSON array of targets to register at start-up.
    #[structopt(short, long)]
    targets: Option<PathBuf>,
    /// Fuzz strategy, 'robin' or 'parallel'.
    #[structopt(short, long)]
    strategy: Option<Strategy>,
    /// Working directory, holds targets, sync dirs, crashes and backups.
    #[structopt(short, long)]
    work_dir: Option<PathBuf>,
    /// Length of one round-robin slice in seconds.
    #[structopt(long)]
    fuzz_interval: Option<u64>,
    /// Container runtime cli, e.g. docker or podman.
    #[structopt(long)]
    runtime: Option<String>,
    /// Do not forward fuzzer output to the log.
    #[structopt(long)]
    suppress_fuzzer_output: bool,
    /// Log level: error, warn, info, debug or trace.
    #[structopt(long, default_value = "info")]
    log_level: simplelog::LevelFilter,
}

fn config(settings: &Settings) -> anyhow::Result<Config> {
    let mut config = match settings.config.as_ref() {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    if let Ok(options) = env::var(OPTIONS_ENV) {
        config.apply_options(&options)?;
    }
    if let Some(s) = settings.strategy {
        config.strategy = s;
    }
    if let Some(dir) = settings.work_dir.as_ref() {
        config.work_dir = dir.clone();
    }
    if let Some(i) = settings.fuzz_interval {
        config.fuzz_interval = i;
    }
    if let Some(bin) = settings.runtime.as_ref() {
        config.runtime_bin = bin.clone();
    }
    if settings.suppress_fuzzer_output {
        config.suppress_fuzzer_output = true;
    }
    Ok(config)
}

pub fn main() {
    let settings = Settings::from_args();
    simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        settings.log_level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )])
    .unwrap();

    let ret = config(&settings).and_then(|c| fuzzherd::boot(c, settings.targets.as_deref()));
    if let Err(e) = ret {
        log::error!("{:?}", e);
        exit(1);
    }
}
