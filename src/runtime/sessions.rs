//! Session driver loops.
//!
//! One driver function per session kind. Each owns the tight loop that
//! invokes [`MesoscopeVr::runtime_cycle`], layers the kind-specific reward
//! logic on top, and always routes termination — normal or aborted —
//! through [`MesoscopeVr::stop`].

use crate::config::{ExperimentConfiguration, LickTrainingConfig, RunTrainingConfig};
use crate::error::{AppResult, VrError};
use crate::runtime::state_machine::MesoscopeVr;
use rand::Rng;
use std::time::Duration;

/// Idle delay between control-loop cycles.
const CYCLE_DELAY: Duration = Duration::from_millis(1);

/// Runs the shared per-cycle step: one state-machine cycle plus renderer
/// re-arm recovery when a desync forced a pause.
async fn drive_cycle(runtime: &mut MesoscopeVr) -> AppResult<()> {
    runtime.runtime_cycle()?;
    if runtime.needs_renderer_rearm() {
        // Blocking recovery path: fetch the fresh cue sequence before the
        // pause can end. Operator-driven abort surfaces as an error.
        runtime.rearm_renderer()?;
    }
    tokio::time::sleep(CYCLE_DELAY).await;
    Ok(())
}

/// Wraps a driver body so `stop()` always runs, even on errors.
async fn finish(runtime: &mut MesoscopeVr, body: AppResult<()>) -> AppResult<()> {
    if body.is_err() {
        runtime.mark_interrupted();
    }
    let stop_result = runtime.stop().await;
    body.and(stop_result)
}

/// Lick training: rewards delivered at randomized delays until the duration
/// elapses or the water ceiling is reached.
pub async fn run_lick_training(
    runtime: &mut MesoscopeVr,
    config: &LickTrainingConfig,
) -> AppResult<()> {
    runtime.start().await?;
    let body = lick_training_body(runtime, config).await;
    finish(runtime, body).await
}

async fn lick_training_body(
    runtime: &mut MesoscopeVr,
    config: &LickTrainingConfig,
) -> AppResult<()> {
    runtime.lick_train()?;

    let minimum_ms = config.minimum_reward_delay.as_millis() as u64;
    let maximum_ms = config.maximum_reward_delay.as_millis() as u64;
    if maximum_ms < minimum_ms {
        return Err(VrError::Configuration(
            "maximum_reward_delay must not be below minimum_reward_delay".into(),
        ));
    }

    let mut next_delay = Duration::from_millis(rand::thread_rng().gen_range(minimum_ms..=maximum_ms));
    let mut last_reward_at = Duration::ZERO;

    while !runtime.terminated() && runtime.active_time() < config.duration {
        drive_cycle(runtime).await?;
        if runtime.paused() {
            continue;
        }
        let active = runtime.active_time();
        if active.saturating_sub(last_reward_at) >= next_delay {
            if runtime.dispensed_ul() / 1_000.0 >= config.water_ceiling_ml {
                log::info!("Water ceiling reached; ending lick training early");
                break;
            }
            runtime.resolve_reward(None)?;
            last_reward_at = active;
            next_delay =
                Duration::from_millis(rand::thread_rng().gen_range(minimum_ms..=maximum_ms));
        }
    }
    Ok(())
}

/// Run training: the animal earns a reward by holding its running speed
/// above a threshold for a required duration. The operator adjusts both
/// thresholds live through the signal array modifiers.
pub async fn run_run_training(
    runtime: &mut MesoscopeVr,
    config: &RunTrainingConfig,
) -> AppResult<()> {
    runtime.start().await?;
    let body = run_training_body(runtime, config).await;
    finish(runtime, body).await
}

async fn run_training_body(
    runtime: &mut MesoscopeVr,
    config: &RunTrainingConfig,
) -> AppResult<()> {
    runtime.run_train()?;

    let mut epoch_started_at: Option<Duration> = None;
    while !runtime.terminated() && runtime.active_time() < config.duration {
        drive_cycle(runtime).await?;
        if runtime.paused() {
            epoch_started_at = None;
            continue;
        }

        let speed_threshold = (config.initial_speed_threshold_cm_s
            + runtime.speed_modifier() as f64 * config.speed_step_cm_s)
            .max(0.1);
        let duration_threshold = Duration::from_millis(
            (config.initial_duration_threshold.as_millis() as i64
                + runtime.duration_modifier() as i64 * config.duration_step.as_millis() as i64)
                .max(50) as u64,
        );

        let active = runtime.active_time();
        if runtime.speed_cm_s() >= speed_threshold {
            let started = *epoch_started_at.get_or_insert(active);
            if active.saturating_sub(started) >= duration_threshold {
                if runtime.dispensed_ul() / 1_000.0 >= config.water_ceiling_ml {
                    log::info!("Water ceiling reached; ending run training early");
                    break;
                }
                runtime.resolve_reward(None)?;
                epoch_started_at = None;
            }
        } else {
            // Speed dropped below threshold: the epoch restarts.
            epoch_started_at = None;
        }
    }
    Ok(())
}

/// Experiment: walks the configured state sequence strictly in order,
/// holding each `(stage, system state, duration)` triple for its active
/// (pause-excluded) duration. Terminal when the sequence is exhausted.
pub async fn run_experiment(
    runtime: &mut MesoscopeVr,
    config: &ExperimentConfiguration,
) -> AppResult<()> {
    config.validate()?;
    runtime.start().await?;
    let body = experiment_body(runtime, config).await;
    finish(runtime, body).await
}

async fn experiment_body(
    runtime: &mut MesoscopeVr,
    config: &ExperimentConfiguration,
) -> AppResult<()> {
    for state in &config.experiment_states {
        if runtime.terminated() {
            break;
        }
        runtime.set_stage(state.stage_code);
        runtime.apply_state_code(state.system_state_code)?;
        log::info!(
            "Experiment stage {} (system state {}) for {:?}",
            state.stage_code,
            state.system_state_code,
            state.duration
        );

        let stage_started = runtime.active_time();
        while !runtime.terminated()
            && runtime.active_time().saturating_sub(stage_started) < state.duration
        {
            drive_cycle(runtime).await?;
        }
    }
    Ok(())
}

/// Window checking: imaging and motor positioning only, running until the
/// operator ends the session. No renderer, no reward logic.
pub async fn run_window_check(runtime: &mut MesoscopeVr) -> AppResult<()> {
    runtime.start().await?;
    let body = window_check_body(runtime).await;
    finish(runtime, body).await
}

async fn window_check_body(runtime: &mut MesoscopeVr) -> AppResult<()> {
    runtime.idle()?;
    while !runtime.terminated() {
        drive_cycle(runtime).await?;
    }
    // Operator-requested exit is the expected way out of a window check.
    Ok(())
}
