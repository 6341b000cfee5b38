//! Readiness polling: glusterd accepts its management socket a little after
//! the process is up, so we poll a cheap control-plane query until it answers.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::runner::{ChildHandle, Cmd, CommandRunner};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(45);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Readiness {
    Ready,
    Timeout { last_stderr: String },
    Died { rc: Option<i32> },
}

/// Polls the control plane until it answers, the timeout elapses, or the
/// supervised process dies. `volume list` is the primary probe; `peer status`
/// is accepted as a fallback because some versions gate the former on a
/// finished volfile load.
pub fn wait_ready(
    runner: &dyn CommandRunner,
    child: &mut dyn ChildHandle,
    timeout: Duration,
) -> Result<Readiness> {
    let start = Instant::now();
    let mut last_stderr = String::new();

    while start.elapsed() < timeout {
        if let Some(rc) = child.try_wait()? {
            return Ok(Readiness::Died { rc: Some(rc) });
        }

        let probe = runner.run(&Cmd::new("gluster").args(["--mode=script", "volume", "list"]))?;
        if probe.success() {
            tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "glusterd ready");
            return Ok(Readiness::Ready);
        }
        last_stderr = probe.stderr.trim().to_string();

        let fallback =
            runner.run(&Cmd::new("gluster").args(["--mode=script", "peer", "status"]))?;
        if fallback.success() {
            tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "glusterd ready");
            return Ok(Readiness::Ready);
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::error!(
        timeout_s = timeout.as_secs(),
        last_stderr = %last_stderr,
        "glusterd readiness timed out"
    );
    Ok(Readiness::Timeout { last_stderr })
}
