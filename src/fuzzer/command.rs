//! Engine command lines.

use super::setup::{Environment, IoOptions};
use crate::{cluster::FUZZER_OUTPUT_DIR, supervisor::ServiceError};
use thiserror::Error;

pub const GO_FUZZ_BIN: &str = "/root/go/bin/go-fuzz";
/// Port go-fuzz serves its stats on inside the unit.
pub const GO_FUZZ_HTTP_PORT: u16 = 8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0} not populated in environment")]
    MissingKey(&'static str),
}

impl From<CommandError> for ServiceError {
    fn from(e: CommandError) -> Self {
        ServiceError::Config(e.to_string())
    }
}

fn required<'a>(env: &'a Environment, key: &'static str) -> Result<&'a str, CommandError> {
    env.get(key).ok_or(CommandError::MissingKey(key))
}

/// `afl-fuzz -i <in>|-i- -o <out> -m <limit> [options] -- <binary>`
pub fn afl_command(env: &Environment, io: &IoOptions) -> Result<Vec<String>, CommandError> {
    let afl_fuzz = required(env, "AFL_FUZZ")?;
    let mem_limit = required(env, "AFL_MEMORY_LIMIT")?;
    let binary = required(env, "AFL_BINARY")?;

    let mut cmd = vec![afl_fuzz.to_string()];
    match &io.input {
        Some(input) => cmd.extend(vec!["-i".to_string(), input.clone()]),
        None => cmd.push("-i-".to_string()),
    }
    cmd.extend(vec![
        "-o".to_string(),
        io.output.clone(),
        "-m".to_string(),
        mem_limit.to_string(),
    ]);
    if let Some(extra) = env.get("AFL_OPTIONS") {
        cmd.extend(extra.split_whitespace().map(String::from));
    }
    cmd.push("--".to_string());
    cmd.push(binary.to_string());
    Ok(cmd)
}

pub fn gofuzz_command(env: &Environment) -> Result<Vec<String>, CommandError> {
    let zip = required(env, "GO_FUZZ_ZIP")?;
    Ok(vec![
        GO_FUZZ_BIN.to_string(),
        format!("-bin={}", zip),
        format!("-workdir={}", FUZZER_OUTPUT_DIR),
        format!("-http=0.0.0.0:{}", GO_FUZZ_HTTP_PORT),
    ])
}
