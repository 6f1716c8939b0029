//! The per-unit worker: one state machine per assigned workload unit.
//!
//! Local states run `Pending → Starting → Running → {Succeeded | Failed}
//! → Terminated`; the phases reported on status are the API's coarser set
//! (Starting reports as Scheduled, Terminated ends with the final
//! Succeeded/Failed report just before the teardown finalizer is
//! released). The worker never deletes or replaces units on its own
//! initiative; it only converges local processes and reports.
use crate::{
    agent::AgentContext,
    artifacts::fetch_with_retry,
    runtime::{ProcessHandle, ProcessState, StartedUnit},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tiller_api::Api;
use tiller_core::{
    kinds::{set_condition, Condition, Phase, WorkloadUnit, WorkloadUnitStatus, CONDITION_READY},
    ErrorResponse, Reason, Resource, ResourceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The finalizer that keeps a unit's object alive until the agent has
/// reported final status and released local state
pub const FINALIZER: &str = "agent.tiller.dev/teardown";

const WRITE_RETRIES: usize = 5;

/// Drives one assigned unit until it is deleted or the agent stops.
///
/// `rx` delivers fresh snapshots from the agent's watch loop; the worker
/// re-reads through the API before every write, so stale or dropped
/// snapshots only delay it.
pub(crate) async fn run_unit(
    ctx: Arc<AgentContext>,
    namespace: String,
    name: String,
    mut rx: mpsc::Receiver<WorkloadUnit>,
) {
    let api: Api<WorkloadUnit> = Api::namespaced(ctx.client.clone(), &namespace);

    let Ok(Some(unit)) = adopt(&api, &name).await else {
        warn!(unit = %name, "could not adopt unit, giving up");
        return;
    };
    if unit.is_deleting() {
        // deleted before anything started; nothing local to unwind
        let _ = release(&api, &name).await;
        return;
    }

    let started = match start_unit(&ctx, &api, &unit).await {
        Ok(started) => started,
        Err(reason) => {
            // terminal: the owning controller decides replacement policy
            let _ = report_phase(&api, &name, Phase::Failed, Some(reason)).await;
            wait_for_deletion(&api, &name, ctx.config.probe_interval, &mut rx).await;
            let _ = release(&api, &name).await;
            return;
        }
    };
    let mut handle = started.handle;
    let artifacts = started.artifacts;

    // readiness starts false when a probe gates it, true otherwise
    let mut ready = unit.spec.readiness_probe.is_none();
    let _ = mutate_status(&api, &name, |status| {
        status.phase = Phase::Running;
        status.unit_ip = Some(started.unit_ip.clone());
        status.reason = None;
        status.message = None;
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_READY, ready, if ready { "NoReadinessProbe" } else { "AwaitingProbe" }),
        );
    })
    .await;
    info!(unit = %name, "unit running");

    let mut liveness_failures: u32 = 0;
    let mut probe_tick = tokio::time::interval(ctx.config.probe_interval);
    probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            snapshot = rx.recv() => match snapshot {
                Some(snapshot) if snapshot.is_deleting() => {
                    teardown(&ctx, &api, &name, &handle, &snapshot).await;
                    return;
                }
                Some(_) => {}
                // the agent dropped this worker
                None => return,
            },
            _ = probe_tick.tick() => {
                // level-triggered guard: re-read rather than trusting the
                // snapshot channel, so a dropped event cannot hide a
                // deletion
                match api.get_opt(&name).await {
                    Ok(Some(current)) if current.is_deleting() => {
                        teardown(&ctx, &api, &name, &handle, &current).await;
                        return;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(err) => {
                        warn!(unit = %name, error = %err, "unit re-read failed");
                        continue;
                    }
                }

                match ctx.runtime.state(&handle).await {
                    Ok(ProcessState::Exited(code)) => {
                        let phase = if code == 0 { Phase::Succeeded } else { Phase::Failed };
                        let reason = (code != 0).then(|| format!("process exited with code {code}"));
                        let _ = report_phase(&api, &name, phase, reason).await;
                        wait_for_deletion(&api, &name, ctx.config.probe_interval, &mut rx).await;
                        let _ = release(&api, &name).await;
                        return;
                    }
                    Ok(ProcessState::Running) => {}
                    Err(err) => {
                        warn!(unit = %name, error = %err, "state query failed");
                        continue;
                    }
                }

                // liveness gates restart, readiness gates traffic; the two
                // never cross
                if let Some(probe) = &unit.spec.liveness_probe {
                    match ctx.runtime.probe(&handle, probe).await {
                        Ok(true) => liveness_failures = 0,
                        Ok(false) => {
                            liveness_failures += 1;
                            debug!(unit = %name, failures = liveness_failures, "liveness probe failed");
                            if liveness_failures >= ctx.config.liveness_threshold {
                                match restart(&ctx, &api, &name, &unit, &handle, &artifacts).await {
                                    Ok(new_handle) => {
                                        handle = new_handle;
                                        liveness_failures = 0;
                                        ready = unit.spec.readiness_probe.is_none();
                                    }
                                    Err(reason) => {
                                        let _ = report_phase(&api, &name, Phase::Failed, Some(reason)).await;
                                        wait_for_deletion(&api, &name, ctx.config.probe_interval, &mut rx).await;
                                        let _ = release(&api, &name).await;
                                        return;
                                    }
                                }
                            }
                        }
                        Err(err) => warn!(unit = %name, error = %err, "liveness probe errored"),
                    }
                }

                if let Some(probe) = &unit.spec.readiness_probe {
                    match ctx.runtime.probe(&handle, probe).await {
                        Ok(outcome) if outcome != ready => {
                            ready = outcome;
                            let reason = if ready { "ProbePassed" } else { "ProbeFailed" };
                            let _ = mutate_status(&api, &name, |status| {
                                set_condition(
                                    &mut status.conditions,
                                    Condition::new(CONDITION_READY, ready, reason),
                                );
                            })
                            .await;
                        }
                        Ok(_) => {}
                        Err(err) => warn!(unit = %name, error = %err, "readiness probe errored"),
                    }
                }
            }
        }
    }
}

struct StartedWithArtifacts {
    handle: ProcessHandle,
    unit_ip: String,
    artifacts: Vec<PathBuf>,
}

/// Fetch artifacts and start processes, both with capped retries.
///
/// The error value is the reason string for the terminal `Failed` phase.
async fn start_unit(
    ctx: &AgentContext,
    api: &Api<WorkloadUnit>,
    unit: &WorkloadUnit,
) -> Result<StartedWithArtifacts, String> {
    let name = unit.name_any();
    let _ = mutate_status(api, &name, |status| {
        status.phase = Phase::Scheduled;
    })
    .await;

    let mut artifacts = Vec::new();
    for process in &unit.spec.processes {
        match fetch_with_retry(
            ctx.fetcher.as_ref(),
            &process.artifact,
            ctx.config.fetch_retries,
            ctx.config.retry_backoff,
        )
        .await
        {
            Ok(path) => artifacts.push(path),
            Err(err) => return Err(format!("FetchFailed: {err}")),
        }
    }

    let mut delay = ctx.config.retry_backoff;
    for attempt in 1..=ctx.config.start_retries.max(1) {
        match ctx.runtime.start(unit, &artifacts).await {
            Ok(StartedUnit { handle, unit_ip }) => {
                return Ok(StartedWithArtifacts { handle, unit_ip, artifacts })
            }
            Err(err) if attempt < ctx.config.start_retries => {
                warn!(unit = %name, attempt, error = %err, "start failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(err) => return Err(format!("StartFailed: {err}")),
        }
    }
    unreachable!("start loop returns on the last attempt")
}

/// Liveness gave up on the current processes: replace them
async fn restart(
    ctx: &AgentContext,
    api: &Api<WorkloadUnit>,
    name: &str,
    unit: &WorkloadUnit,
    handle: &ProcessHandle,
    artifacts: &[PathBuf],
) -> Result<ProcessHandle, String> {
    info!(unit = %name, "liveness threshold crossed, restarting processes");
    let _ = ctx.runtime.kill(handle).await;
    match ctx.runtime.start(unit, artifacts).await {
        Ok(started) => {
            let ready = unit.spec.readiness_probe.is_none();
            let _ = mutate_status(api, name, |status| {
                status.restart_count += 1;
                status.unit_ip = Some(started.unit_ip.clone());
                set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_READY, ready, "Restarted"),
                );
            })
            .await;
            Ok(started.handle)
        }
        Err(err) => Err(format!("RestartFailed: {err}")),
    }
}

/// Graceful stop, bounded by the unit's grace period, then force kill;
/// final status is reported before local state (and the finalizer) go.
async fn teardown(
    ctx: &AgentContext,
    api: &Api<WorkloadUnit>,
    name: &str,
    handle: &ProcessHandle,
    unit: &WorkloadUnit,
) {
    info!(unit = %name, "deletion observed, stopping processes");
    let _ = ctx.runtime.signal_stop(handle).await;

    let grace = Duration::from_secs(unit.spec.termination_grace_seconds);
    let deadline = tokio::time::Instant::now() + grace;
    let exit_code = loop {
        match ctx.runtime.state(handle).await {
            Ok(ProcessState::Exited(code)) => break Some(code),
            Ok(ProcessState::Running) if tokio::time::Instant::now() >= deadline => break None,
            Ok(ProcessState::Running) => {
                tokio::time::sleep(ctx.config.stop_poll_interval).await;
            }
            Err(_) => break None,
        }
    };
    let exit_code = match exit_code {
        Some(code) => code,
        None => {
            warn!(unit = %name, "grace period elapsed, force terminating");
            let _ = ctx.runtime.kill(handle).await;
            137
        }
    };

    let phase = if exit_code == 0 { Phase::Succeeded } else { Phase::Failed };
    let reason = (exit_code != 0).then(|| format!("terminated with code {exit_code}"));
    // report before releasing, or the controller layer would see the unit
    // vanish without a final state
    let _ = report_phase(api, name, phase, reason).await;
    let _ = release(api, name).await;
}

async fn report_phase(
    api: &Api<WorkloadUnit>,
    name: &str,
    phase: Phase,
    reason: Option<String>,
) -> Result<(), ErrorResponse> {
    mutate_status(api, name, |status| {
        status.phase = phase;
        status.reason = reason.clone().map(|r| r.split(':').next().unwrap_or("Failed").to_string());
        status.message = reason.clone();
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_READY, false, "Terminal"),
        );
    })
    .await
}

/// Block until deletion is requested (or the object is gone).
///
/// Polls the API alongside the snapshot channel for the same reason the
/// probe loop does: a dropped event must not strand a terminal unit.
async fn wait_for_deletion(
    api: &Api<WorkloadUnit>,
    name: &str,
    poll_interval: Duration,
    rx: &mut mpsc::Receiver<WorkloadUnit>,
) {
    let mut tick = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            snapshot = rx.recv() => match snapshot {
                Some(snapshot) if snapshot.is_deleting() => return,
                Some(_) => {}
                None => return,
            },
            _ = tick.tick() => match api.get_opt(name).await {
                Ok(Some(unit)) if unit.is_deleting() => return,
                Ok(None) => return,
                _ => {}
            },
        }
    }
}

/// Attach the teardown finalizer, returning the current object
async fn adopt(api: &Api<WorkloadUnit>, name: &str) -> Result<Option<WorkloadUnit>, ErrorResponse> {
    for _ in 0..WRITE_RETRIES {
        let Some(mut unit) = api.get_opt(name).await? else {
            return Ok(None);
        };
        if unit.finalizers().iter().any(|f| f == FINALIZER) || unit.is_deleting() {
            return Ok(Some(unit));
        }
        unit.meta_mut().finalizers.push(FINALIZER.to_string());
        match api.replace(&unit).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(err) if err.reason == Reason::Conflict => continue,
            Err(err) => return Err(err),
        }
    }
    Err(ErrorResponse::conflict(format!("kept losing writes adopting {name}")))
}

/// Remove the teardown finalizer so the store can erase the object
async fn release(api: &Api<WorkloadUnit>, name: &str) -> Result<(), ErrorResponse> {
    for _ in 0..WRITE_RETRIES {
        let Some(mut unit) = api.get_opt(name).await? else {
            return Ok(());
        };
        if !unit.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        unit.meta_mut().finalizers.retain(|f| f != FINALIZER);
        match api.replace(&unit).await {
            Ok(_) => return Ok(()),
            Err(err) if err.reason == Reason::Conflict => continue,
            Err(err) if err.reason == Reason::NotFound => return Ok(()),
            Err(err) => return Err(err),
        }
    }
    Err(ErrorResponse::conflict(format!("kept losing writes releasing {name}")))
}

/// Rewrite a unit's status with bounded conflict retries.
///
/// Re-reads before every attempt so concurrent status writers (the
/// scheduler, another probe worker) are merged rather than clobbered.
async fn mutate_status(
    api: &Api<WorkloadUnit>,
    name: &str,
    mutate: impl Fn(&mut WorkloadUnitStatus),
) -> Result<(), ErrorResponse> {
    for _ in 0..WRITE_RETRIES {
        let Some(mut unit) = api.get_opt(name).await? else {
            return Ok(());
        };
        let status = unit.status.get_or_insert_with(WorkloadUnitStatus::default);
        mutate(status);
        match api.replace_status(&unit).await {
            Ok(_) => return Ok(()),
            Err(err) if err.reason == Reason::Conflict => continue,
            Err(err) => return Err(err),
        }
    }
    Err(ErrorResponse::conflict(format!("kept losing status writes for {name}")))
}
