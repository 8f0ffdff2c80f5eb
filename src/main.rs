//! Command-line entry point for the Mesoscope-VR acquisition system.
//!
//! The CLI is a thin layer: it loads configuration, wires the runtime
//! collaborators together and dispatches into the library. All orchestration
//! logic lives in `mesovr_daq`.

use clap::{Parser, Subcommand};
use mesovr_daq::clock::MonotonicClock;
use mesovr_daq::config::{
    ExperimentConfiguration, LickTrainingConfig, RunTrainingConfig, SessionKind,
    SystemConfiguration,
};
use mesovr_daq::error::{AppResult, VrError};
use mesovr_daq::hardware::bus::{HardwareParameters, MicrocontrollerBus};
use mesovr_daq::hardware::bus_types::BusTransport;
use mesovr_daq::hardware::motors::{MockMotorBank, MotorBank, MotorTarget};
use mesovr_daq::lifecycle;
use mesovr_daq::runtime::logger::EventLogger;
use mesovr_daq::runtime::sessions;
use mesovr_daq::runtime::signals::OperatorSignals;
use mesovr_daq::runtime::state_machine::MesoscopeVr;
use mesovr_daq::runtime::{channel_pair, StdinOperator};
use mesovr_daq::session::artifacts::{load_yaml, save_yaml, SessionRecord};
use mesovr_daq::session::{Session, SessionPaths};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "mesovr",
    about = "Mesoscope-VR data acquisition and data lifecycle management",
    version
)]
struct Cli {
    /// Path to the system configuration file.
    #[arg(long, default_value = "mesovr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a lick-training session.
    LickTrain {
        #[arg(short, long)]
        project: String,
        #[arg(short, long)]
        animal: String,
        #[arg(short, long)]
        experimenter: String,
    },
    /// Run a run-training session.
    RunTrain {
        #[arg(short, long)]
        project: String,
        #[arg(short, long)]
        animal: String,
        #[arg(short, long)]
        experimenter: String,
    },
    /// Run an experiment session.
    Experiment {
        #[arg(short, long)]
        project: String,
        #[arg(short, long)]
        animal: String,
        #[arg(short, long)]
        experimenter: String,
        /// Path to the experiment configuration YAML.
        #[arg(long)]
        experiment_config: PathBuf,
    },
    /// Run a cranial-window checking session.
    CheckWindow {
        #[arg(short, long)]
        project: String,
        #[arg(short, long)]
        animal: String,
        #[arg(short, long)]
        experimenter: String,
    },
    /// Hardware maintenance and valve calibration utilities.
    Maintain {
        #[command(subcommand)]
        action: MaintenanceAction,
    },
    /// Retry or resume preprocessing for an existing session.
    Preprocess {
        /// Path to the session directory.
        #[arg(short, long)]
        session_path: PathBuf,
    },
    /// Remove redundant, marker-cleared session data from all machines.
    Purge,
    /// Compute and persist the checksum of a directory tree.
    Checksum {
        /// Directory to hash.
        directory: PathBuf,
    },
}

#[derive(Subcommand)]
enum MaintenanceAction {
    /// Open the water valve.
    Open,
    /// Close the water valve.
    Close,
    /// Close the valve after a ten-second delay.
    Close10,
    /// Dispense the reference volume ten times to spot-check calibration.
    Reference,
    /// Pulse the valve repeatedly with a fixed open duration.
    Calibrate {
        /// Valve open duration per pulse, in milliseconds.
        pulse_ms: u32,
        /// Number of pulses.
        #[arg(default_value_t = 200)]
        count: u32,
    },
    /// Lock the motors against manual motion.
    Lock,
    /// Unlock the motors for manual motion.
    Unlock,
    /// Move the motors to the maintenance position.
    Maintain,
    /// Move the motors to the animal mounting position.
    Mount,
    /// Start imaging acquisition for visual inspection.
    Image,
    /// Capture the objective-position snapshot interactively.
    Snapshot,
}

fn build_transport(config: &SystemConfiguration) -> AppResult<Box<dyn BusTransport>> {
    #[cfg(feature = "instrument_serial")]
    {
        Ok(Box::new(
            mesovr_daq::hardware::serial::SerialBusTransport::new(
                &config.hardware.serial_port,
                config.hardware.baud_rate,
            ),
        ))
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = config;
        Err(VrError::SerialFeatureDisabled)
    }
}

fn build_bus(config: &SystemConfiguration, clock: MonotonicClock) -> AppResult<MicrocontrollerBus> {
    let parameters = HardwareParameters {
        valve_calibration: config.hardware.calibration()?,
        lick_threshold_adc: config.hardware.lick_threshold_adc,
        cm_per_pulse: config.hardware.cm_per_pulse,
        torque_per_adc_unit: config.hardware.torque_per_adc_unit,
        screens_initially_on: false,
    };
    Ok(MicrocontrollerBus::new(
        build_transport(config)?,
        parameters,
        clock,
    ))
}

/// Assembles a runtime for a fresh session of the given kind.
fn build_runtime(
    config: &SystemConfiguration,
    kind: SessionKind,
    project: &str,
    animal: &str,
    experimenter: &str,
) -> AppResult<(MesoscopeVr, PathBuf)> {
    let session = Session::create(project, animal);
    let paths = SessionPaths::resolve(&config.paths.root_directory, &session);
    paths.materialize()?;

    let record = SessionRecord::new(project, animal, &session.name, kind, experimenter);
    save_yaml(&paths.session_record(), &record)?;

    let clock = MonotonicClock::start();
    let bus = build_bus(config, clock.clone())?;
    let logger = EventLogger::start(paths.behavior_log.clone(), clock.clone())?;
    let signals = OperatorSignals::create(&paths.session_root.join("operator_signals.bin"))?;
    let session_path = paths.session_root.clone();

    let runtime = MesoscopeVr::new(
        kind,
        config.runtime.clone(),
        session,
        paths,
        bus,
        Box::new(MockMotorBank::new()),
        Box::new(StdinOperator::new()),
        logger,
        clock,
    )
    .with_signals(signals);
    Ok((runtime, session_path))
}

/// Runs a session driver and hands the finished session to the lifecycle
/// manager.
async fn run_and_preprocess<F>(
    config: &SystemConfiguration,
    session_path: PathBuf,
    driver: F,
) -> AppResult<()>
where
    F: std::future::Future<Output = AppResult<()>>,
{
    driver.await?;
    lifecycle::preprocess_session(config, &session_path)
}

async fn run_maintenance(
    config: &SystemConfiguration,
    action: MaintenanceAction,
) -> AppResult<()> {
    let clock = MonotonicClock::start();
    let mut bus = build_bus(config, clock)?;
    bus.connect()?;
    let mut motors = MockMotorBank::new();
    motors
        .connect()
        .await
        .map_err(|error| VrError::Hardware(format!("motor bank connect failed: {error}")))?;

    let motor_result: anyhow::Result<()> = match action {
        MaintenanceAction::Open => {
            bus.set_valve_open(true)?;
            Ok(())
        }
        MaintenanceAction::Close => {
            bus.set_valve_open(false)?;
            Ok(())
        }
        MaintenanceAction::Close10 => {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            bus.set_valve_open(false)?;
            Ok(())
        }
        MaintenanceAction::Reference => {
            for _ in 0..10 {
                bus.deliver_reward(config.runtime.reward_volume_ul)?;
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Ok(())
        }
        MaintenanceAction::Calibrate { pulse_ms, count } => {
            log::info!("Calibrating valve: {count} pulses of {pulse_ms} ms");
            for _ in 0..count {
                bus.pulse_valve(pulse_ms * 1_000)?;
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Ok(())
        }
        MaintenanceAction::Lock => motors.lock().await,
        MaintenanceAction::Unlock => motors.unlock().await,
        MaintenanceAction::Maintain => motors.move_to(MotorTarget::Calibration).await,
        MaintenanceAction::Mount => motors.move_to(MotorTarget::Mount).await,
        MaintenanceAction::Image => {
            bus.start_imaging()?;
            Ok(())
        }
        MaintenanceAction::Snapshot => {
            let positions = mesovr_daq::session::artifacts::ObjectivePositions::default();
            let path = config.paths.root_directory.join("objective_positions.yaml");
            save_yaml(&path, &positions)?;
            log::info!("Objective position snapshot written to {}", path.display());
            Ok(())
        }
    };
    motor_result.map_err(|error| VrError::Hardware(error.to_string()))?;
    bus.disconnect()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(error) = dispatch(cli).await {
        log::error!("{error}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> AppResult<()> {
    let config = SystemConfiguration::load_from(&cli.config)?;

    match cli.command {
        Command::LickTrain {
            project,
            animal,
            experimenter,
        } => {
            let (mut runtime, session_path) = build_runtime(
                &config,
                SessionKind::LickTraining,
                &project,
                &animal,
                &experimenter,
            )?;
            let training = LickTrainingConfig::default();
            run_and_preprocess(
                &config,
                session_path,
                sessions::run_lick_training(&mut runtime, &training),
            )
            .await
        }
        Command::RunTrain {
            project,
            animal,
            experimenter,
        } => {
            let (mut runtime, session_path) = build_runtime(
                &config,
                SessionKind::RunTraining,
                &project,
                &animal,
                &experimenter,
            )?;
            let training = RunTrainingConfig::default();
            run_and_preprocess(
                &config,
                session_path,
                sessions::run_run_training(&mut runtime, &training),
            )
            .await
        }
        Command::Experiment {
            project,
            animal,
            experimenter,
            experiment_config,
        } => {
            let experiment: ExperimentConfiguration = load_yaml(&experiment_config)?;
            let (runtime, session_path) = build_runtime(
                &config,
                SessionKind::Experiment,
                &project,
                &animal,
                &experimenter,
            )?;
            // The renderer-side endpoint is where the game-engine bridge
            // attaches; the bridge process itself is outside this system.
            let (control, _renderer_endpoint) = channel_pair();
            let mut runtime = runtime
                .with_renderer(Box::new(control))
                .with_experiment(experiment.clone());
            run_and_preprocess(
                &config,
                session_path,
                sessions::run_experiment(&mut runtime, &experiment),
            )
            .await
        }
        Command::CheckWindow {
            project,
            animal,
            experimenter,
        } => {
            let (mut runtime, session_path) = build_runtime(
                &config,
                SessionKind::WindowChecking,
                &project,
                &animal,
                &experimenter,
            )?;
            run_and_preprocess(
                &config,
                session_path,
                sessions::run_window_check(&mut runtime),
            )
            .await
        }
        Command::Maintain { action } => run_maintenance(&config, action).await,
        Command::Preprocess { session_path } => {
            lifecycle::preprocess_session(&config, &session_path)
        }
        Command::Purge => {
            let report = lifecycle::purge_redundant_data(&config)?;
            log::info!(
                "Purged {} imaging-host directories and {} acquisition-host raw data trees",
                report.imaging_removed,
                report.acquisition_removed
            );
            Ok(())
        }
        Command::Checksum { directory } => {
            let digest =
                lifecycle::write_checksum(&directory, config.preprocessing.worker_threads)?;
            println!("{digest}");
            Ok(())
        }
    }
}
