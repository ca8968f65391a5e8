use crate::supervisor::{ServiceError, Stop};
use std::{
    os::raw::c_int,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

/// Runs a blocking collaborator call off the async workers.
pub async fn blocking<F, T, E>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?.map_err(Into::into)
}

/// Outcome of waiting for engine-created paths.
#[derive(Debug, PartialEq, Eq)]
pub enum Wait {
    Ready,
    Stopped,
}

/// Polls until every path exists. The poll interval grows from 100ms up to
/// `max_interval`; gives up after `timeout`.
pub async fn wait_for_paths(
    paths: &[PathBuf],
    max_interval: Duration,
    timeout: Duration,
    stop: &mut Stop,
) -> Result<Wait, ServiceError> {
    let deadline = Instant::now() + timeout;
    let mut interval = Duration::from_millis(100).min(max_interval);
    loop {
        if paths.iter().all(|p| p.exists()) {
            return Ok(Wait::Ready);
        }
        if Instant::now() >= deadline {
            let missing = paths
                .iter()
                .filter(|p| !p.exists())
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ServiceError::WaitTimeout(timeout, missing));
        }
        if stop.sleep(interval).await {
            return Ok(Wait::Stopped);
        }
        interval = (interval * 2).min(max_interval);
    }
}

pub fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Waits for a terminating signal on a dedicated thread and flips `shutdown`.
pub fn setup_signal_handler(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    std::thread::spawn(move || {
        if let Some(info) = signals.into_iter().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            println!("please wait for fuzzers to exit...");
        }
        let _ = shutdown.send(true);
    });
    Ok(())
}
