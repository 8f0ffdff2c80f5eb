//! The Mesoscope-VR runtime state machine.
//!
//! One `MesoscopeVr` instance owns one session's control loop: it drives the
//! hardware bus, exchanges messages with the external task renderer,
//! triggers and monitors the imaging device, reacts to operator signals and
//! computes running behavioral metrics. It is the **only** writer of the
//! four hardware state aspects (break, encoder, torque sensor, screens);
//! every change goes through the explicit state-transition methods and is
//! logged with a timestamped state code.
//!
//! # Control flow
//!
//! The owning driver calls [`MesoscopeVr::start`], then invokes
//! [`MesoscopeVr::runtime_cycle`] in a tight loop until the runtime
//! terminates, then calls [`MesoscopeVr::stop`]. `runtime_cycle` never
//! blocks; the intentionally blocking waits (hardware handshakes, renderer
//! arming, imaging confirmation) all live in `start()` and the explicit
//! recovery entry points, each bounded by a timeout followed by an operator
//! prompt.

use crate::clock::MonotonicClock;
use crate::config::{ExperimentConfiguration, RuntimeSettings, SessionKind};
use crate::error::{AppResult, VrError};
use crate::hardware::bus::MicrocontrollerBus;
use crate::hardware::motors::{MotorBank, MotorTarget};
use crate::hardware::trackers::SharedTrackers;
use crate::runtime::logger::{
    EventLogger, HEADER_GUIDANCE, HEADER_RENDERER_TERMINATED, HEADER_RUNTIME_STAGE,
    HEADER_SYSTEM_STATE, STATE_MACHINE_SOURCE_ID,
};
use crate::runtime::operator::{Decision, OperatorInterface};
use crate::runtime::pause::PauseLedger;
use crate::runtime::renderer::{
    CueSequencePayload, TaskMessage, TaskRendererChannel, TOPIC_CUE_SEQUENCE,
    TOPIC_CUE_SEQUENCE_REQUEST, TOPIC_GUIDANCE_DISABLE, TOPIC_GUIDANCE_ENABLE, TOPIC_LICK,
    TOPIC_MOTION, TOPIC_REWARD_BOUNDARY_HIDE, TOPIC_REWARD_BOUNDARY_SHOW, TOPIC_REWARD_TRIGGER,
    TOPIC_TERMINATED,
};
use crate::runtime::signals::OperatorSignals;
use crate::runtime::trials::decompose_trials;
use crate::runtime::watchdog::{HeartbeatStatus, HeartbeatWatchdog};
use crate::session::artifacts::{
    save_yaml, HardwareSnapshot, MotorPositions, ObjectivePositions, SessionDescriptor,
};
use crate::session::{Session, SessionPaths};
use std::sync::Arc;
use std::time::Duration;

/// Runtime stage code logged while the system idles between active phases.
pub const STAGE_IDLE: u8 = 0;
/// Runtime stage code logged during active training.
pub const STAGE_ACTIVE_TRAINING: u8 = 255;

/// Frames that must arrive before imaging acquisition counts as started.
const IMAGING_CONFIRMATION_FRAMES: u64 = 10;
/// Poll interval for the blocking confirmation waits in `start()`.
const CONFIRMATION_POLL: Duration = Duration::from_millis(10);
/// Sliding window over which running speed is computed.
const SPEED_WINDOW_US: u64 = 100_000;

/// One of the five Mesoscope-VR system states.
///
/// All states are reachable from any other state; each transition is atomic
/// and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Idle,
    Rest,
    Run,
    LickTrain,
    RunTrain,
}

/// The hardware configuration tuple one system state pins down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateAspects {
    pub break_engaged: bool,
    pub encoder_enabled: bool,
    pub torque_enabled: bool,
    pub screens_on: bool,
    pub lick_enabled: bool,
}

impl SystemState {
    /// Byte code written into the event log with every transition.
    pub fn code(&self) -> u8 {
        match self {
            SystemState::Idle => 0,
            SystemState::Rest => 1,
            SystemState::Run => 2,
            SystemState::LickTrain => 3,
            SystemState::RunTrain => 4,
        }
    }

    /// Resolves a logged byte code back to a state.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SystemState::Idle),
            1 => Some(SystemState::Rest),
            2 => Some(SystemState::Run),
            3 => Some(SystemState::LickTrain),
            4 => Some(SystemState::RunTrain),
            _ => None,
        }
    }

    /// The fixed hardware aspect tuple of this state.
    pub fn aspects(&self) -> StateAspects {
        match self {
            SystemState::Idle => StateAspects {
                break_engaged: true,
                encoder_enabled: false,
                torque_enabled: false,
                screens_on: false,
                lick_enabled: false,
            },
            SystemState::Rest => StateAspects {
                break_engaged: true,
                encoder_enabled: false,
                torque_enabled: true,
                screens_on: false,
                lick_enabled: true,
            },
            SystemState::Run => StateAspects {
                break_engaged: false,
                encoder_enabled: true,
                torque_enabled: false,
                screens_on: true,
                lick_enabled: true,
            },
            SystemState::LickTrain => StateAspects {
                break_engaged: true,
                encoder_enabled: false,
                torque_enabled: true,
                screens_on: false,
                lick_enabled: true,
            },
            SystemState::RunTrain => StateAspects {
                break_engaged: false,
                encoder_enabled: true,
                torque_enabled: false,
                screens_on: false,
                lick_enabled: true,
            },
        }
    }
}

/// What `resolve_reward` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardOutcome {
    /// Water was dispensed through the valve.
    Dispensed,
    /// The unconsumed-reward ceiling was reached; only the tone sounded.
    Simulated,
}

/// The Mesoscope-VR runtime state machine.
pub struct MesoscopeVr {
    kind: SessionKind,
    settings: RuntimeSettings,
    session: Session,
    paths: SessionPaths,
    experiment: Option<ExperimentConfiguration>,

    bus: MicrocontrollerBus,
    motors: Box<dyn MotorBank>,
    renderer: Option<Box<dyn TaskRendererChannel>>,
    signals: Option<OperatorSignals>,
    operator: Box<dyn OperatorInterface>,
    logger: EventLogger,
    clock: MonotonicClock,
    trackers: Arc<SharedTrackers>,

    state: SystemState,
    stage: u8,
    started: bool,
    stopped: bool,
    terminated: bool,
    interrupted: bool,

    pause: PauseLedger,
    pre_pause_state: Option<SystemState>,
    dispensed_at_pause_ul: f64,
    renderer_desynced: bool,

    reward_volume_ul: f64,
    unconsumed_rewards: u32,
    last_lick_count: u64,

    published_distance_cm: f64,
    speed_anchor_us: u64,
    speed_anchor_cm: f64,
    speed_cm_s: f64,
    cue_sequence: Vec<u8>,
    trial_boundaries_cm: Vec<f64>,

    watchdog: HeartbeatWatchdog,
    imaging_active: bool,
    heartbeat_faulted: bool,
    guidance_enabled: bool,

    objective_positions: ObjectivePositions,
}

impl MesoscopeVr {
    /// Assembles a runtime over already-constructed collaborators.
    ///
    /// Nothing touches hardware until [`start`](Self::start) runs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SessionKind,
        settings: RuntimeSettings,
        session: Session,
        paths: SessionPaths,
        bus: MicrocontrollerBus,
        motors: Box<dyn MotorBank>,
        operator: Box<dyn OperatorInterface>,
        logger: EventLogger,
        clock: MonotonicClock,
    ) -> Self {
        let trackers = bus.trackers();
        let watchdog = HeartbeatWatchdog::new(settings.heartbeat_interval, settings.heartbeat_grace);
        let reward_volume_ul = settings.reward_volume_ul;
        Self {
            kind,
            settings,
            session,
            paths,
            experiment: None,
            bus,
            motors,
            renderer: None,
            signals: None,
            operator,
            logger,
            clock,
            trackers,
            state: SystemState::Idle,
            stage: STAGE_IDLE,
            started: false,
            stopped: false,
            terminated: false,
            interrupted: false,
            pause: PauseLedger::new(),
            pre_pause_state: None,
            dispensed_at_pause_ul: 0.0,
            renderer_desynced: false,
            reward_volume_ul,
            unconsumed_rewards: 0,
            last_lick_count: 0,
            published_distance_cm: 0.0,
            speed_anchor_us: 0,
            speed_anchor_cm: 0.0,
            speed_cm_s: 0.0,
            cue_sequence: Vec::new(),
            trial_boundaries_cm: Vec::new(),
            watchdog,
            imaging_active: false,
            heartbeat_faulted: false,
            guidance_enabled: false,
            objective_positions: ObjectivePositions::default(),
        }
    }

    /// Attaches the task renderer channel (experiment sessions).
    pub fn with_renderer(mut self, renderer: Box<dyn TaskRendererChannel>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Attaches the operator signal array.
    pub fn with_signals(mut self, signals: OperatorSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Attaches the experiment configuration (experiment sessions).
    pub fn with_experiment(mut self, experiment: ExperimentConfiguration) -> Self {
        self.experiment = Some(experiment);
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Acquires every hardware resource and arms the external assets.
    ///
    /// Fails fatally if the host lacks the required logical core count or if
    /// any hardware handshake fails — no data-generating state is entered on
    /// a partial start. Contains the runtime's only intentionally blocking
    /// waits, each bounded by a timeout followed by an operator prompt.
    pub async fn start(&mut self) -> AppResult<()> {
        self.verify_host_capacity()?;
        self.paths.materialize()?;

        self.bus.connect()?;

        self.motors
            .connect()
            .await
            .map_err(|error| VrError::Hardware(format!("motor bank connect failed: {error}")))?;
        self.position_motors().await?;

        if self.kind.uses_renderer() {
            self.operator.notify(
                "Arm the task renderer (start the virtual task), then the runtime will \
                 request the cue sequence.",
            );
            self.fetch_cue_sequence()?;
        }

        if self.kind.uses_imaging() {
            self.start_imaging_with_confirmation()?;
        }

        self.apply_state(SystemState::Idle)?;
        self.set_stage(STAGE_IDLE);
        self.started = true;
        log::info!(
            "Runtime started: {} session {} for {}/{}",
            self.kind,
            self.session.name,
            self.session.project,
            self.session.animal
        );
        Ok(())
    }

    fn verify_host_capacity(&self) -> AppResult<()> {
        let system =
            sysinfo::System::new_with_specifics(sysinfo::RefreshKind::nothing().with_cpu(
                sysinfo::CpuRefreshKind::everything(),
            ));
        let available = system.cpus().len();
        let required = self.settings.minimum_cpu_cores;
        if available < required {
            return Err(VrError::InsufficientCores {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Restores the previous session's motor geometry, or moves to the
    /// mounting position for the animal's first session.
    async fn position_motors(&mut self) -> AppResult<()> {
        let previous = self.paths.previous_motor_positions();
        let result = if previous.exists() {
            let positions: MotorPositions = crate::session::artifacts::load_yaml(&previous)?;
            self.motors.restore(&positions).await
        } else {
            self.motors.move_to(MotorTarget::Mount).await
        };
        result.map_err(|error| VrError::Hardware(format!("motor positioning failed: {error}")))
    }

    /// Requests the cue sequence from the renderer, with bounded automatic
    /// retries before every further attempt requires an operator decision.
    fn fetch_cue_sequence(&mut self) -> AppResult<()> {
        let timeout = self.settings.cue_request_timeout;
        let mut automatic_retries = self.settings.cue_request_retries;
        loop {
            match self.request_cue_sequence_once(timeout) {
                Ok(sequence) => {
                    self.adopt_cue_sequence(sequence)?;
                    return Ok(());
                }
                Err(error @ VrError::RendererTimeout { .. }) => {
                    log::warn!("{error}");
                    if automatic_retries > 0 {
                        automatic_retries -= 1;
                        continue;
                    }
                    let decision = self.operator.decide(
                        "The task renderer did not answer the cue sequence request. Make sure \
                         the renderer is running and configured, then retry.",
                    );
                    if decision == Decision::Abort {
                        return Err(VrError::AbortedByOperator);
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn request_cue_sequence_once(&mut self, timeout: Duration) -> AppResult<Vec<u8>> {
        let renderer = self
            .renderer
            .as_mut()
            .ok_or_else(|| VrError::Renderer("no renderer channel attached".into()))?;
        renderer.publish(TaskMessage::trigger(TOPIC_CUE_SEQUENCE_REQUEST))?;
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Some(message) = renderer.try_next() {
                if message.topic == TOPIC_CUE_SEQUENCE {
                    let payload: CueSequencePayload = serde_json::from_slice(&message.payload)?;
                    return Ok(payload.cue_sequence);
                }
                // Anything else that arrives while waiting is discarded.
                continue;
            }
            std::thread::sleep(CONFIRMATION_POLL);
        }
        Err(VrError::RendererTimeout {
            topic: TOPIC_CUE_SEQUENCE_REQUEST.to_string(),
            timeout,
        })
    }

    /// Logs the received sequence and recovers the trial boundaries.
    fn adopt_cue_sequence(&mut self, sequence: Vec<u8>) -> AppResult<()> {
        let templates = self
            .experiment
            .as_ref()
            .map(|experiment| experiment.trial_templates.as_slice())
            .unwrap_or(&[]);
        self.trial_boundaries_cm = decompose_trials(&sequence, templates)?;
        self.logger
            .log(STATE_MACHINE_SOURCE_ID, sequence.clone());
        self.cue_sequence = sequence;
        log::info!(
            "Cue sequence received: {} cues, {} trials",
            self.cue_sequence.len(),
            self.trial_boundaries_cm.len()
        );
        Ok(())
    }

    /// Starts imaging acquisition and blocks until frames are confirmed,
    /// retrying per operator decision.
    fn start_imaging_with_confirmation(&mut self) -> AppResult<()> {
        loop {
            self.bus.reset_frame_count();
            self.bus.start_imaging()?;
            log::info!("Imaging acquisition trigger sent; waiting for frame pulses");
            let deadline = std::time::Instant::now() + self.settings.startup_confirmation_timeout;
            while std::time::Instant::now() < deadline {
                self.bus.poll();
                if self.trackers.frame_count() >= IMAGING_CONFIRMATION_FRAMES {
                    self.imaging_active = true;
                    self.watchdog
                        .arm(self.trackers.frame_count(), self.clock.elapsed_us());
                    log::info!("Imaging frame acquisition confirmed");
                    return Ok(());
                }
                std::thread::sleep(CONFIRMATION_POLL);
            }
            let decision = self.operator.decide(
                "The imaging device did not confirm frame acquisition. Make sure it is armed \
                 for externally-triggered acquisition, then retry.",
            );
            if decision == Decision::Abort {
                return Err(VrError::AbortedByOperator);
            }
        }
    }

    /// Releases all hardware resources and writes the end-of-session
    /// snapshot files. Idempotent under repeated calls; every step is
    /// attempted even when earlier steps fail, and the driver invokes it on
    /// both normal and abnormal termination.
    pub async fn stop(&mut self) -> AppResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let mut errors: Vec<VrError> = Vec::new();

        if self.pause.paused() {
            self.pause.end(self.clock.elapsed_us());
        }

        if self.bus.connected() {
            if let Err(error) = self.apply_state(SystemState::Idle) {
                errors.push(error);
            }
            if self.imaging_active {
                if let Err(error) = self.stop_imaging_and_drain() {
                    errors.push(error);
                }
            }
        }
        self.watchdog.disarm();

        if let Err(error) = self.write_snapshots().await {
            errors.push(error);
        }
        if let Err(error) = self.logger.shutdown() {
            errors.push(error);
        }
        if let Err(error) = self.motors.shutdown().await {
            errors.push(VrError::Hardware(format!("motor shutdown failed: {error}")));
        }
        if let Err(error) = self.bus.disconnect() {
            errors.push(error);
        }

        log::info!("Runtime stopped: session {}", self.session.name);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(VrError::ShutdownFailed(errors))
        }
    }

    /// Sends the stop trigger, then blocks until frame pulses cease.
    fn stop_imaging_and_drain(&mut self) -> AppResult<()> {
        self.bus.stop_imaging()?;
        let mut previous = self.trackers.frame_count();
        let deadline = std::time::Instant::now() + self.settings.startup_confirmation_timeout;
        loop {
            std::thread::sleep(self.settings.heartbeat_interval * 2);
            self.bus.poll();
            let current = self.trackers.frame_count();
            if current == previous {
                break;
            }
            previous = current;
            if std::time::Instant::now() > deadline {
                log::warn!("Imaging device kept producing frames past the stop deadline");
                break;
            }
        }
        self.imaging_active = false;
        Ok(())
    }

    async fn write_snapshots(&mut self) -> AppResult<()> {
        // Motor positions: session copy plus the persistent cache the next
        // session restores from.
        match self.motors.positions().await {
            Ok(positions) => {
                save_yaml(&self.paths.motor_positions(), &positions)?;
                save_yaml(&self.paths.previous_motor_positions(), &positions)?;
            }
            Err(error) => {
                log::error!("Could not capture motor positions: {error}");
            }
        }

        if self.kind.uses_imaging() {
            save_yaml(&self.paths.objective_positions(), &self.objective_positions)?;
        }

        let mut hardware = HardwareSnapshot::default();
        self.bus.write_snapshot(&mut hardware);
        if let Some(experiment) = &self.experiment {
            hardware.cue_map = Some(experiment.cue_map.clone());
        }
        save_yaml(&self.paths.hardware_snapshot(), &hardware)?;

        let descriptor = self.build_descriptor();
        save_yaml(&self.paths.session_descriptor(), &descriptor)?;
        save_yaml(&self.paths.previous_descriptor(self.kind), &descriptor)?;
        Ok(())
    }

    fn build_descriptor(&self) -> SessionDescriptor {
        let now_us = self.clock.elapsed_us();
        let mut descriptor = SessionDescriptor::new(
            self.kind,
            self.reward_volume_ul,
            self.settings.maximum_unconsumed_rewards,
        );
        descriptor.dispensed_water_ml = self.trackers.dispensed_ul() / 1_000.0;
        descriptor.active_runtime_s = self.pause.active(now_us).as_secs_f64();
        descriptor.paused_s =
            Duration::from_micros(self.pause.total_paused_us(now_us)).as_secs_f64();
        descriptor.traveled_distance_cm = self.distance_cm();
        descriptor.incomplete = self.interrupted;
        descriptor
    }

    // =========================================================================
    // The control loop
    // =========================================================================

    /// One non-blocking pass of the control loop.
    ///
    /// Reads hardware outputs and updates derived metrics, drains at most
    /// one pending renderer message, polls the operator signal flags, and
    /// checks the imaging heartbeat with bounded automatic recovery.
    pub fn runtime_cycle(&mut self) -> AppResult<()> {
        if !self.started || self.stopped {
            return Ok(());
        }

        self.bus.poll();
        self.update_metrics()?;
        self.renderer_cycle()?;
        self.signals_cycle()?;
        self.heartbeat_cycle()?;
        Ok(())
    }

    fn update_metrics(&mut self) -> AppResult<()> {
        let now_us = self.clock.elapsed_us();
        let distance_cm = self.distance_cm();

        if now_us.saturating_sub(self.speed_anchor_us) >= SPEED_WINDOW_US {
            let dt_s = (now_us - self.speed_anchor_us) as f64 / 1_000_000.0;
            self.speed_cm_s = (distance_cm - self.speed_anchor_cm) / dt_s;
            self.speed_anchor_us = now_us;
            self.speed_anchor_cm = distance_cm;
        }

        // A new lick consumes any outstanding rewards.
        let licks = self.trackers.lick_count();
        if licks > self.last_lick_count {
            self.last_lick_count = licks;
            self.unconsumed_rewards = 0;
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.publish(TaskMessage::trigger(TOPIC_LICK))?;
            }
        }
        Ok(())
    }

    fn renderer_cycle(&mut self) -> AppResult<()> {
        if self.renderer.is_none() {
            return Ok(());
        }

        // Push the wheel motion delta, if the animal moved.
        let distance_cm = self.distance_cm();
        let delta_cm = distance_cm - self.published_distance_cm;
        if delta_cm != 0.0 {
            self.published_distance_cm = distance_cm;
            let payload = serde_json::to_vec(&serde_json::json!({ "movement": delta_cm }))?;
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.publish(TaskMessage::new(TOPIC_MOTION, payload))?;
            }
        }

        // Drain at most one pending message per cycle.
        let Some(message) = self.renderer.as_mut().and_then(|r| r.try_next()) else {
            return Ok(());
        };
        match message.topic.as_str() {
            TOPIC_REWARD_TRIGGER => {
                self.resolve_reward(None)?;
            }
            TOPIC_TERMINATED => {
                self.handle_renderer_termination()?;
            }
            _ => {
                log::debug!("Discarding unexpected renderer message on '{}'", message.topic);
            }
        }
        Ok(())
    }

    fn signals_cycle(&mut self) -> AppResult<()> {
        let (pause_requested, reward_requested, exit_requested) = match self.signals.as_mut() {
            None => return Ok(()),
            Some(signals) => (
                signals.pause_requested(),
                signals.take_reward_signal(),
                signals.take_exit_signal(),
            ),
        };

        if pause_requested {
            if !self.pause.paused() {
                self.pause_runtime()?;
            }
        } else if self.pause.paused() {
            self.try_resume()?;
        }

        if reward_requested {
            self.resolve_reward(None)?;
        }

        if exit_requested {
            // Cooperative abort: the driver routes through stop().
            self.terminated = true;
            self.interrupted = true;
            log::warn!("Operator abort signal received; terminating runtime");
        }
        Ok(())
    }

    fn heartbeat_cycle(&mut self) -> AppResult<()> {
        if !self.imaging_active || self.heartbeat_faulted {
            return Ok(());
        }
        let now_us = self.clock.elapsed_us();
        match self.watchdog.observe(self.trackers.frame_count(), now_us) {
            HeartbeatStatus::Alive => Ok(()),
            HeartbeatStatus::Stalled => {
                log::warn!(
                    "Imaging heartbeat silent for {} us; sending one recovery trigger",
                    self.watchdog.silent_for_us(now_us)
                );
                self.bus.start_imaging()
            }
            HeartbeatStatus::Lost => {
                self.heartbeat_faulted = true;
                let silent_for = Duration::from_micros(self.watchdog.silent_for_us(now_us));
                log::error!("{}", VrError::HeartbeatLost { silent_for });
                if !self.pause.paused() {
                    self.pause_runtime()?;
                }
                self.operator.notify(&format!(
                    "Imaging frame pulses stopped ({silent_for:?} of silence) and one automatic \
                     recovery trigger did not revive them. The runtime is paused. Check the \
                     imaging device, then unpause to continue or abort the runtime."
                ));
                Ok(())
            }
        }
    }

    // =========================================================================
    // State transitions (the only writers of the hardware state aspects)
    // =========================================================================

    fn apply_state(&mut self, state: SystemState) -> AppResult<()> {
        let aspects = state.aspects();
        self.bus.set_screens(aspects.screens_on)?;
        self.bus.set_break(aspects.break_engaged)?;
        self.bus.set_encoder(aspects.encoder_enabled)?;
        self.bus.set_torque(aspects.torque_enabled)?;
        self.bus.set_lick_monitoring(aspects.lick_enabled)?;
        self.state = state;
        self.logger.log(
            STATE_MACHINE_SOURCE_ID,
            vec![HEADER_SYSTEM_STATE, state.code()],
        );
        log::info!("Mesoscope-VR system state: {state:?}");
        Ok(())
    }

    /// Switches to the idle state and resets the runtime stage.
    pub fn idle(&mut self) -> AppResult<()> {
        self.set_stage(STAGE_IDLE);
        self.apply_state(SystemState::Idle)
    }

    /// Switches to the rest state.
    pub fn rest(&mut self) -> AppResult<()> {
        self.apply_state(SystemState::Rest)
    }

    /// Switches to the run state.
    pub fn run(&mut self) -> AppResult<()> {
        self.apply_state(SystemState::Run)
    }

    /// Switches to the lick-training state.
    pub fn lick_train(&mut self) -> AppResult<()> {
        self.set_stage(STAGE_ACTIVE_TRAINING);
        self.apply_state(SystemState::LickTrain)
    }

    /// Switches to the run-training state.
    pub fn run_train(&mut self) -> AppResult<()> {
        self.set_stage(STAGE_ACTIVE_TRAINING);
        self.apply_state(SystemState::RunTrain)
    }

    /// Applies an experiment-sequence system state by its byte code.
    pub fn apply_state_code(&mut self, code: u8) -> AppResult<()> {
        let state = SystemState::from_code(code).ok_or_else(|| {
            VrError::Configuration(format!("unknown system state code {code}"))
        })?;
        self.apply_state(state)
    }

    /// Updates and logs the runtime stage, orthogonal to the system state.
    pub fn set_stage(&mut self, stage: u8) {
        self.stage = stage;
        self.logger
            .log(STATE_MACHINE_SOURCE_ID, vec![HEADER_RUNTIME_STAGE, stage]);
    }

    // =========================================================================
    // Rewards
    // =========================================================================

    /// Delivers a water reward, unless the unconsumed-reward ceiling was
    /// reached, in which case only the audible cue sounds. Returns which
    /// action was taken.
    pub fn resolve_reward(&mut self, size_ul: Option<f64>) -> AppResult<RewardOutcome> {
        let cap = self.settings.maximum_unconsumed_rewards;
        if cap > 0 && self.unconsumed_rewards >= cap {
            self.bus.simulate_reward()?;
            return Ok(RewardOutcome::Simulated);
        }
        let volume = size_ul.unwrap_or(self.reward_volume_ul);
        self.bus.deliver_reward(volume)?;
        if !self.pause.paused() {
            self.unconsumed_rewards += 1;
        }
        Ok(RewardOutcome::Dispensed)
    }

    // =========================================================================
    // Pause / resume and renderer desync recovery
    // =========================================================================

    /// Forces the idle state, freezes reward accounting and opens a pause
    /// interval.
    pub fn pause_runtime(&mut self) -> AppResult<()> {
        if self.pause.paused() {
            return Ok(());
        }
        self.pre_pause_state = Some(self.state);
        self.dispensed_at_pause_ul = self.trackers.dispensed_ul();
        self.idle()?;
        self.pause.begin(self.clock.elapsed_us());
        // Runtime-initiated pauses (heartbeat loss, renderer desync) raise
        // the shared pause flag too, so the pause holds until the operator
        // explicitly clears it.
        if let Some(signals) = self.signals.as_mut() {
            signals.set_pause(true);
        }
        log::warn!("Runtime paused");
        Ok(())
    }

    /// Resumes from a pause unless the renderer still needs re-arming.
    ///
    /// Water dispensed during the pause is discarded from session accounting
    /// and the pre-pause state is restored.
    pub fn try_resume(&mut self) -> AppResult<bool> {
        if !self.pause.paused() {
            return Ok(true);
        }
        if self.renderer_desynced {
            // The driver must re-arm the renderer first.
            return Ok(false);
        }
        self.trackers.set_dispensed_ul(self.dispensed_at_pause_ul);
        self.pause.end(self.clock.elapsed_us());
        self.heartbeat_faulted = false;
        if self.imaging_active {
            self.watchdog
                .arm(self.trackers.frame_count(), self.clock.elapsed_us());
        }
        if let Some(state) = self.pre_pause_state.take() {
            self.apply_state(state)?;
        }
        log::warn!("Runtime resumed");
        Ok(true)
    }

    /// Reacts to an unexpected renderer session termination: snapshots the
    /// traveled distance, pauses and requires a re-arm before resuming.
    fn handle_renderer_termination(&mut self) -> AppResult<()> {
        let distance_cm = self.distance_cm();
        self.pause_runtime()?;
        let mut payload = vec![HEADER_RENDERER_TERMINATED];
        payload.extend_from_slice(&distance_cm.to_le_bytes());
        self.logger.log(STATE_MACHINE_SOURCE_ID, payload);
        self.renderer_desynced = true;
        self.operator.notify(
            "The task renderer terminated unexpectedly. The runtime is paused; restart the \
             renderer, then the runtime will re-fetch the cue sequence before resuming.",
        );
        Ok(())
    }

    /// Re-arms the renderer after a desync: re-fetches the cue sequence
    /// (renderer restarts always produce a new sequence) and clears the
    /// desync flag. The next `try_resume` can then succeed.
    pub fn rearm_renderer(&mut self) -> AppResult<()> {
        if !self.renderer_desynced {
            return Ok(());
        }
        self.fetch_cue_sequence()?;
        self.renderer_desynced = false;
        Ok(())
    }

    /// Publishes the reward-zone boundary visibility toggle.
    pub fn set_reward_boundary_visible(&mut self, visible: bool) -> AppResult<()> {
        if let Some(renderer) = self.renderer.as_mut() {
            let topic = if visible {
                TOPIC_REWARD_BOUNDARY_SHOW
            } else {
                TOPIC_REWARD_BOUNDARY_HIDE
            };
            renderer.publish(TaskMessage::trigger(topic))?;
        }
        Ok(())
    }

    /// Publishes the lick-guidance toggle and logs the new state.
    pub fn set_guidance(&mut self, enabled: bool) -> AppResult<()> {
        if let Some(renderer) = self.renderer.as_mut() {
            let topic = if enabled {
                TOPIC_GUIDANCE_ENABLE
            } else {
                TOPIC_GUIDANCE_DISABLE
            };
            renderer.publish(TaskMessage::trigger(topic))?;
        }
        self.guidance_enabled = enabled;
        self.logger.log(
            STATE_MACHINE_SOURCE_ID,
            vec![HEADER_GUIDANCE, enabled as u8],
        );
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Marks the runtime as interrupted (early termination).
    pub fn mark_interrupted(&mut self) {
        self.terminated = true;
        self.interrupted = true;
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn paused(&self) -> bool {
        self.pause.paused()
    }

    pub fn needs_renderer_rearm(&self) -> bool {
        self.renderer_desynced
    }

    pub fn heartbeat_faulted(&self) -> bool {
        self.heartbeat_faulted
    }

    /// Cumulative distance traveled, in centimeters.
    pub fn distance_cm(&self) -> f64 {
        self.trackers.distance_cm(self.bus.cm_per_pulse())
    }

    /// Running speed over the last speed window, in cm/s.
    pub fn speed_cm_s(&self) -> f64 {
        self.speed_cm_s
    }

    /// Number of trials whose end boundary the animal has passed.
    pub fn completed_trials(&self) -> usize {
        let distance_cm = self.distance_cm();
        self.trial_boundaries_cm
            .iter()
            .filter(|boundary| **boundary <= distance_cm)
            .count()
    }

    /// Total water dispensed so far, in microliters.
    pub fn dispensed_ul(&self) -> f64 {
        self.trackers.dispensed_ul()
    }

    /// Active (non-paused) runtime so far.
    pub fn active_time(&self) -> Duration {
        self.pause.active(self.clock.elapsed_us())
    }

    /// Current operator speed-threshold modifier (run training).
    pub fn speed_modifier(&self) -> i32 {
        self.signals
            .as_ref()
            .map_or(0, |signals| signals.speed_modifier())
    }

    /// Current operator duration-threshold modifier (run training).
    pub fn duration_modifier(&self) -> i32 {
        self.signals
            .as_ref()
            .map_or(0, |signals| signals.duration_modifier())
    }

    /// The recovered per-trial cumulative end distances.
    pub fn trial_boundaries_cm(&self) -> &[f64] {
        &self.trial_boundaries_cm
    }
}
