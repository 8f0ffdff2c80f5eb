//! End-to-end properties of the runtime state machine, driven through a
//! mock bus transport and the in-process renderer channel.

use mesovr_daq::clock::MonotonicClock;
use mesovr_daq::config::{
    ExperimentConfiguration, ExperimentState, RuntimeSettings, SessionKind, TrialTemplate,
};
use mesovr_daq::hardware::bus::{HardwareParameters, MicrocontrollerBus, MockTransport};
use mesovr_daq::hardware::bus_types::{ModuleCommand, ModuleEvent, ModuleKind, ModuleMessage};
use mesovr_daq::hardware::motors::MockMotorBank;
use mesovr_daq::config::ValveCalibration;
use mesovr_daq::runtime::logger::EventLogger;
use mesovr_daq::runtime::renderer::{
    channel_pair, RendererEndpoint, TaskMessage, TOPIC_CUE_SEQUENCE, TOPIC_CUE_SEQUENCE_REQUEST,
    TOPIC_TERMINATED,
};
use mesovr_daq::runtime::signals::OperatorSignals;
use mesovr_daq::runtime::state_machine::{MesoscopeVr, RewardOutcome, SystemState};
use mesovr_daq::runtime::{Decision, ScriptedOperator};
use mesovr_daq::session::{Session, SessionPaths};
use std::time::Duration;
use tempfile::TempDir;

fn test_settings() -> RuntimeSettings {
    RuntimeSettings {
        minimum_cpu_cores: 1,
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_grace: Duration::from_millis(100),
        cue_request_timeout: Duration::from_millis(500),
        cue_request_retries: 0,
        startup_confirmation_timeout: Duration::from_millis(500),
        maximum_unconsumed_rewards: 2,
        reward_volume_ul: 5.0,
    }
}

fn calibration() -> ValveCalibration {
    ValveCalibration::new(vec![(15_000.0, 1.8556), (30_000.0, 3.4844)]).expect("calibration")
}

fn experiment_config() -> ExperimentConfiguration {
    ExperimentConfiguration {
        cue_map: [(1u8, 10.0), (2u8, 20.0)].into_iter().collect(),
        trial_templates: vec![TrialTemplate {
            cues: vec![1, 2],
            length_cm: 30.0,
        }],
        experiment_states: vec![ExperimentState {
            stage_code: 1,
            system_state_code: 1,
            duration: Duration::from_millis(100),
        }],
    }
}

struct Harness {
    runtime: MesoscopeVr,
    transport: MockTransport,
    _root: TempDir,
}

fn build_harness(kind: SessionKind) -> Harness {
    let root = TempDir::new().expect("temp root");
    let session = Session::create("tyche", "a7");
    let paths = SessionPaths::resolve(root.path(), &session);
    paths.materialize().expect("materialize");

    let clock = MonotonicClock::start();
    let transport = MockTransport::new();
    let bus = MicrocontrollerBus::new(
        Box::new(transport.clone()),
        HardwareParameters::with_calibration(calibration()),
        clock.clone(),
    );
    let logger = EventLogger::start(paths.behavior_log.clone(), clock.clone()).expect("logger");

    let runtime = MesoscopeVr::new(
        kind,
        test_settings(),
        session,
        paths,
        bus,
        Box::new(MockMotorBank::new()),
        Box::new(ScriptedOperator::always(Decision::Retry, true)),
        logger,
        clock,
    );
    Harness {
        runtime,
        transport,
        _root: root,
    }
}

fn push_frame_pulses(transport: &MockTransport, count: usize) {
    for _ in 0..count {
        transport.push_inbound(ModuleMessage {
            module: ModuleKind::FrameTtl,
            event: ModuleEvent::FramePulse,
        });
    }
}

fn push_lick(transport: &MockTransport) {
    for adc in [500u16, 0] {
        transport.push_inbound(ModuleMessage {
            module: ModuleKind::Lick,
            event: ModuleEvent::LickLevel { adc },
        });
    }
}

/// Answers every cue-sequence request on the renderer side with a fixed
/// sequence, from a background thread.
fn spawn_renderer_responder(mut endpoint: RendererEndpoint, cues: Vec<u8>) {
    std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            if let Some(message) = endpoint.try_next() {
                if message.topic == TOPIC_CUE_SEQUENCE_REQUEST {
                    let payload =
                        serde_json::to_vec(&serde_json::json!({ "cue_sequence": cues.clone() }))
                            .expect("payload");
                    let _ = endpoint.publish(TaskMessage::new(TOPIC_CUE_SEQUENCE, payload));
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    });
}

#[tokio::test]
async fn test_unconsumed_reward_cap_throttles_then_recovers() {
    let mut harness = build_harness(SessionKind::LickTraining);
    harness.runtime.start().await.expect("start");

    // Cap is 2: two dispensed, the third is simulated.
    assert_eq!(
        harness.runtime.resolve_reward(None).expect("first"),
        RewardOutcome::Dispensed
    );
    assert_eq!(
        harness.runtime.resolve_reward(None).expect("second"),
        RewardOutcome::Dispensed
    );
    assert_eq!(
        harness.runtime.resolve_reward(None).expect("third"),
        RewardOutcome::Simulated
    );

    // A lick consumes the backlog; dispensing resumes immediately.
    push_lick(&harness.transport);
    harness.runtime.runtime_cycle().expect("cycle");
    assert_eq!(
        harness.runtime.resolve_reward(None).expect("after lick"),
        RewardOutcome::Dispensed
    );

    harness.runtime.stop().await.expect("stop");
}

#[tokio::test]
async fn test_pause_freezes_reward_accounting_and_restores_state() {
    let mut harness = build_harness(SessionKind::LickTraining);
    harness.runtime.start().await.expect("start");
    harness.runtime.rest().expect("rest");

    harness.runtime.resolve_reward(Some(2.0)).expect("reward");
    harness.runtime.runtime_cycle().expect("cycle");
    let dispensed_before_pause = harness.runtime.dispensed_ul();
    assert!(dispensed_before_pause > 0.0);

    harness.runtime.pause_runtime().expect("pause");
    assert!(harness.runtime.paused());
    assert_eq!(harness.runtime.state(), SystemState::Idle);

    // Water dispensed while paused is discarded from session accounting.
    harness.runtime.resolve_reward(Some(3.0)).expect("paused reward");
    harness.runtime.runtime_cycle().expect("cycle");
    std::thread::sleep(Duration::from_millis(20));

    assert!(harness.runtime.try_resume().expect("resume"));
    assert!(!harness.runtime.paused());
    assert_eq!(harness.runtime.state(), SystemState::Rest);
    assert!((harness.runtime.dispensed_ul() - dispensed_before_pause).abs() < 0.01);

    // Active time excludes the pause we just took.
    let active = harness.runtime.active_time();
    std::thread::sleep(Duration::from_millis(5));
    assert!(harness.runtime.active_time() >= active);

    harness.runtime.stop().await.expect("stop");
}

#[tokio::test]
async fn test_renderer_termination_pauses_and_requires_rearm() {
    let harness = build_harness(SessionKind::Experiment);
    let (control, renderer_endpoint) = channel_pair();
    let mut test_endpoint = renderer_endpoint.clone();
    let mut runtime = harness
        .runtime
        .with_renderer(Box::new(control))
        .with_experiment(experiment_config());

    // Renderer side: answer cue requests; imaging side: confirm frames.
    spawn_renderer_responder(renderer_endpoint, vec![1, 2, 1, 2]);
    push_frame_pulses(&harness.transport, 10);
    runtime.start().await.expect("start");
    assert_eq!(runtime.trial_boundaries_cm(), &[30.0, 60.0]);

    runtime.rest().expect("rest");

    // The renderer announces an unexpected termination mid-run.
    test_endpoint
        .publish(TaskMessage::trigger(TOPIC_TERMINATED))
        .expect("publish termination");
    runtime.runtime_cycle().expect("cycle");
    assert!(runtime.paused());
    assert!(runtime.needs_renderer_rearm());

    // Resuming is refused until the renderer is re-armed.
    assert!(!runtime.try_resume().expect("resume refused"));

    // Re-arm: the responder answers the fresh cue request, then the pause
    // can end and the pre-pause state comes back.
    runtime.rearm_renderer().expect("rearm");
    assert!(runtime.try_resume().expect("resume"));
    assert_eq!(runtime.state(), SystemState::Rest);

    runtime.stop().await.expect("stop");
}

#[tokio::test]
async fn test_heartbeat_loss_recovers_once_then_escalates() {
    let harness = build_harness(SessionKind::WindowChecking);
    let mut runtime = harness.runtime;
    push_frame_pulses(&harness.transport, 10);
    runtime.start().await.expect("start");

    // No further pulses: past the heartbeat bound the runtime re-sends the
    // start trigger exactly once.
    std::thread::sleep(Duration::from_millis(70));
    runtime.runtime_cycle().expect("cycle");
    let start_triggers = harness
        .transport
        .sent_frames()
        .iter()
        .filter(|frame| {
            frame.module == ModuleKind::FrameTtl
                && frame.command == ModuleCommand::StartAcquisition
        })
        .count();
    assert_eq!(start_triggers, 2, "initial trigger plus one recovery");

    // Still silent past the grace window: escalate, pause, prompt.
    std::thread::sleep(Duration::from_millis(120));
    runtime.runtime_cycle().expect("cycle");
    assert!(runtime.heartbeat_faulted());
    assert!(runtime.paused());

    runtime.stop().await.expect("stop");
}

#[tokio::test]
async fn test_operator_exit_signal_terminates_cooperatively() {
    let harness = build_harness(SessionKind::LickTraining);
    let root = harness._root.path().to_path_buf();
    let signals_path = root.join("operator_signals.bin");
    let reader = OperatorSignals::create(&signals_path).expect("create signals");
    let mut writer = OperatorSignals::open(&signals_path).expect("open signals");

    let mut runtime = harness.runtime.with_signals(reader);
    runtime.start().await.expect("start");
    runtime.lick_train().expect("lick train");

    writer.request_exit();
    runtime.runtime_cycle().expect("cycle");
    assert!(runtime.terminated());
    assert!(runtime.interrupted());

    // Termination always routes through stop(), which is idempotent.
    runtime.stop().await.expect("first stop");
    runtime.stop().await.expect("second stop");
}

#[tokio::test]
async fn test_state_transitions_reach_all_states_and_log() {
    let mut harness = build_harness(SessionKind::LickTraining);
    harness.runtime.start().await.expect("start");

    harness.runtime.rest().expect("rest");
    harness.runtime.run().expect("run");
    harness.runtime.run_train().expect("run train");
    harness.runtime.lick_train().expect("lick train");
    harness.runtime.idle().expect("idle");
    assert_eq!(harness.runtime.state(), SystemState::Idle);
    assert_eq!(harness.runtime.stage(), 0);

    // The break toggles exactly with the state table: engaged in idle,
    // released in run states.
    let break_toggles: Vec<bool> = harness
        .transport
        .sent_frames()
        .iter()
        .filter(|frame| frame.module == ModuleKind::Break)
        .filter_map(|frame| match frame.command {
            ModuleCommand::Toggle { on } => Some(on),
            _ => None,
        })
        .collect();
    assert_eq!(break_toggles, vec![true, true, false, false, true, true]);

    harness.runtime.stop().await.expect("stop");
}
