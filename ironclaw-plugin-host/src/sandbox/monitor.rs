//! Worker supervision: wall clock, memory and CPU polling

use ironclaw_plugin_api::ResourceLimits;
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One resource reading of a worker process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub status: String,
    pub threads: Option<usize>,
}

/// Polling parameters for one invocation
#[derive(Debug, Clone)]
pub(crate) struct MonitorSettings {
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

/// Why supervision ended
#[derive(Debug)]
pub(crate) enum MonitorOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    MemoryExceeded { used_mb: f64 },
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct MonitorReport {
    pub outcome: MonitorOutcome,
    pub last_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub cpu_breaches: u32,
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    Tick,
}

/// Watch `child` until it exits or a limit ends it
///
/// Every sample is published to `latest` for live stats. Breaching a limit
/// terminates the worker before returning; CPU breaches are only counted.
pub(crate) async fn supervise(
    child: &mut Child,
    settings: &MonitorSettings,
    cancel: &Notify,
    latest: &Mutex<Option<ProcessSample>>,
) -> MonitorReport {
    let started = Instant::now();
    let pid = child.id().map(Pid::from_u32);
    let mut system = System::new();
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut report = MonitorReport {
        outcome: MonitorOutcome::Cancelled,
        last_memory_mb: 0.0,
        peak_memory_mb: 0.0,
        cpu_breaches: 0,
    };
    let memory_limit_mb = settings.limits.max_memory_mb as f64;

    loop {
        let event = tokio::select! {
            status = child.wait() => Event::Exited(status),
            _ = cancel.notified() => Event::Cancelled,
            _ = ticker.tick() => Event::Tick,
        };

        match event {
            Event::Exited(status) => {
                report.outcome = MonitorOutcome::Exited(status);
                return report;
            }
            Event::Cancelled => {
                terminate(child, settings.kill_grace).await;
                report.outcome = MonitorOutcome::Cancelled;
                return report;
            }
            Event::Tick => {}
        }

        if started.elapsed() > settings.timeout {
            tracing::warn!(
                pid = ?pid,
                timeout_ms = settings.timeout.as_millis() as u64,
                "Worker exceeded its time limit"
            );
            terminate(child, settings.kill_grace).await;
            report.outcome = MonitorOutcome::TimedOut;
            return report;
        }

        let Some(sample) = pid.and_then(|pid| sample_process(&mut system, pid)) else {
            continue;
        };

        report.last_memory_mb = sample.memory_mb;
        report.peak_memory_mb = report.peak_memory_mb.max(sample.memory_mb);

        if sample.memory_mb > memory_limit_mb {
            tracing::warn!(
                pid = ?pid,
                used_mb = sample.memory_mb,
                limit_mb = settings.limits.max_memory_mb,
                "Worker exceeded its memory limit"
            );
            let used_mb = sample.memory_mb;
            publish(latest, sample);
            terminate(child, settings.kill_grace).await;
            report.outcome = MonitorOutcome::MemoryExceeded { used_mb };
            return report;
        }

        if f64::from(sample.cpu_percent) > settings.limits.max_cpu_percent {
            report.cpu_breaches += 1;
            tracing::warn!(
                pid = ?pid,
                cpu_percent = sample.cpu_percent,
                limit_percent = settings.limits.max_cpu_percent,
                "Worker above its CPU limit"
            );
        }

        publish(latest, sample);
    }
}

fn publish(latest: &Mutex<Option<ProcessSample>>, sample: ProcessSample) {
    *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
}

/// Read memory and CPU for `pid`; CPU is measured against the previous
/// refresh of `system`
pub(crate) fn sample_process(system: &mut System, pid: Pid) -> Option<ProcessSample> {
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory().with_cpu(),
    );
    let process = system.process(pid)?;

    Some(ProcessSample {
        memory_mb: process.memory() as f64 / BYTES_PER_MB,
        cpu_percent: process.cpu_usage(),
        status: process.status().to_string(),
        threads: process.tasks().map(|tasks| tasks.len()),
    })
}

/// Graceful signal, then a forced kill once `grace` runs out
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    request_exit(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => return,
        Ok(Err(e)) => tracing::warn!(error = %e, "Error waiting for worker"),
        Err(_) => tracing::warn!(pid = ?child.id(), "Worker did not exit gracefully, force killing"),
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}

#[cfg(unix)]
fn request_exit(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn settings(timeout: Duration) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(50),
            kill_grace: Duration::from_millis(500),
            timeout,
            limits: ResourceLimits::default(),
        }
    }

    fn spawn_sleep(seconds: &str) -> Child {
        Command::new("sleep")
            .arg(seconds)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_is_reported() {
        let mut child = Command::new("true").spawn().unwrap();
        let latest = Mutex::new(None);
        let report = supervise(
            &mut child,
            &settings(Duration::from_secs(5)),
            &Notify::new(),
            &latest,
        )
        .await;

        assert!(matches!(report.outcome, MonitorOutcome::Exited(Ok(status)) if status.success()));
    }

    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let mut child = spawn_sleep("10");
        let latest = Mutex::new(None);
        let started = Instant::now();
        let report = supervise(
            &mut child,
            &settings(Duration::from_millis(300)),
            &Notify::new(),
            &latest,
        )
        .await;

        assert!(matches!(report.outcome, MonitorOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
        assert!(latest.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let mut child = spawn_sleep("10");
        let latest = Mutex::new(None);
        let cancel = Notify::new();
        // A stored permit is consumed by the first `notified()`.
        cancel.notify_one();

        let report = supervise(
            &mut child,
            &settings(Duration::from_secs(5)),
            &cancel,
            &latest,
        )
        .await;

        assert!(matches!(report.outcome, MonitorOutcome::Cancelled));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_sample_current_process() {
        let mut system = System::new();
        let sample = sample_process(&mut system, Pid::from_u32(std::process::id())).unwrap();
        assert!(sample.memory_mb > 0.0);
        assert!(!sample.status.is_empty());
    }
}
