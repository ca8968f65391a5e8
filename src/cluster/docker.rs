//! [`ClusterRuntime`] backed by the docker command line.

use super::{ClusterRuntime, RuntimeError, UnitSpec, UnitState};
use crate::target_log::OutputSink;
use nix::unistd::setsid;
use std::{
    io,
    os::unix::process::CommandExt,
    process::{Command, Output, Stdio},
    thread,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).stdin(Stdio::null());
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<String, RuntimeError> {
        let desc = format!("{:?}", cmd);
        log::debug!("runtime: {}", desc);
        let Output {
            status,
            stdout,
            stderr,
        } = cmd.output().map_err(|e| RuntimeError::Spawn {
            cmd: desc.clone(),
            reason: e.to_string(),
        })?;
        if status.success() {
            Ok(String::from_utf8_lossy(&stdout).trim().to_string())
        } else {
            Err(RuntimeError::Failed {
                cmd: desc,
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            })
        }
    }
}

/// Arguments of `docker create` for `spec`.
pub fn create_args(spec: &UnitSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if spec.auto_remove {
        args.push("--rm".to_string());
    }
    for (k, v) in spec.env.iter() {
        args.push("-e".to_string());
        args.push(format!("{}={}", k, v));
    }
    for m in spec.mounts.iter() {
        args.push("--mount".to_string());
        args.push(format!(
            "type=bind,source={},target={}",
            m.source.display(),
            m.target
        ));
    }
    for p in spec.ports.iter() {
        args.push("-p".to_string());
        args.push(format!("0.0.0.0:{}:{}/tcp", p.host, p.container));
    }
    let mut entry = spec.entrypoint.iter();
    if let Some(prog) = entry.next() {
        args.push("--entrypoint".to_string());
        args.push(prog.clone());
    }
    args.push(spec.image.clone());
    args.extend(entry.cloned());
    args
}

fn parse_state(cmd: &str, out: &str) -> Result<UnitState, RuntimeError> {
    let bad = || RuntimeError::Parse {
        cmd: cmd.to_string(),
        output: out.to_string(),
    };
    let mut items = out.split_whitespace();
    let running = match items.next() {
        Some("true") => true,
        Some("false") => false,
        _ => return Err(bad()),
    };
    let exit_code = items
        .next()
        .and_then(|c| c.parse::<i64>().ok())
        .ok_or_else(bad)?;
    Ok(UnitState { running, exit_code })
}

impl ClusterRuntime for DockerCli {
    fn ping(&self) -> Result<(), RuntimeError> {
        let version = self.run(self.cmd(&["version", "--format", "{{.Server.Version}}"]))?;
        log::info!("container runtime: {} {}", self.bin, version);
        Ok(())
    }

    fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(create_args(spec)).stdin(Stdio::null());
        self.run(cmd)
    }

    fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(self.cmd(&["start", id])).map(|_| ())
    }

    fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().to_string();
        self.run(self.cmd(&["stop", "-t", &secs, id])).map(|_| ())
    }

    fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let args: &[&str] = if force {
            &["rm", "-f", id]
        } else {
            &["rm", id]
        };
        self.run(self.cmd(args)).map(|_| ())
    }

    fn inspect(&self, id: &str) -> Result<UnitState, RuntimeError> {
        let out = self.run(self.cmd(&[
            "inspect",
            "--format",
            "{{.State.Running}} {{.State.ExitCode}}",
            id,
        ]))?;
        parse_state("inspect", &out)
    }

    fn commit(&self, id: &str, repository: &str) -> Result<String, RuntimeError> {
        let out = self.run(self.cmd(&["commit", id, repository]))?;
        if out.is_empty() {
            return Err(RuntimeError::Parse {
                cmd: "commit".to_string(),
                output: out,
            });
        }
        Ok(out)
    }

    fn follow(
        &self,
        id: &str,
        mut stdout: OutputSink,
        mut stderr: OutputSink,
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.cmd(&["logs", "-f", id]);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        unsafe {
            cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        let mut child = cmd.spawn().map_err(|e| RuntimeError::Spawn {
            cmd: format!("{} logs -f {}", self.bin, id),
            reason: e.to_string(),
        })?;
        let (out, err) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                let _ = child.kill();
                return Err(RuntimeError::Spawn {
                    cmd: format!("{} logs -f {}", self.bin, id),
                    reason: "output not captured".to_string(),
                });
            }
        };
        thread::spawn(move || {
            let mut err = err;
            let _ = io::copy(&mut err, &mut stderr);
        });
        thread::spawn(move || {
            let mut out = out;
            let _ = io::copy(&mut out, &mut stdout);
            let _ = child.wait();
        });
        Ok(())
    }
}
