//! Motor bank abstraction for the headbar and lickport positioning motors.
//!
//! Vendor motor-controller bindings are an external collaborator; the
//! runtime only consumes this positioning contract. Implementations are
//! expected to block (asynchronously) until motion settles — motor
//! positioning is one of the few intentionally blocking waits in `start()`.

use crate::session::artifacts::MotorPositions;
use anyhow::Result;
use async_trait::async_trait;

/// Named motor targets used by the maintenance utility and the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorTarget {
    /// Reference (homing) position.
    Home,
    /// Animal mounting position.
    Mount,
    /// Parked position used outside sessions.
    Park,
    /// Valve-calibration position (lickport over the scale).
    Calibration,
}

/// Positioning contract for the motor bank.
#[async_trait]
pub trait MotorBank: Send + Sync {
    /// Establishes the controller connection and energizes the motors.
    async fn connect(&mut self) -> Result<()>;

    /// Homes all axes against their reference switches.
    async fn home(&mut self) -> Result<()>;

    /// Moves all axes to a named target position.
    async fn move_to(&mut self, target: MotorTarget) -> Result<()>;

    /// Restores all axes to an absolute position snapshot.
    async fn restore(&mut self, positions: &MotorPositions) -> Result<()>;

    /// Current absolute positions of all axes.
    async fn positions(&self) -> Result<MotorPositions>;

    /// Prevents manual motion (maintenance lock).
    async fn lock(&mut self) -> Result<()>;

    /// Re-allows manual motion.
    async fn unlock(&mut self) -> Result<()>;

    /// Parks the motors and releases the controller connection.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Simulated motor bank with instantaneous motion, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockMotorBank {
    positions: MotorPositions,
    locked: bool,
    connected: bool,
}

impl MockMotorBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked(&self) -> bool {
        self.locked
    }
}

#[async_trait]
impl MotorBank for MockMotorBank {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn home(&mut self) -> Result<()> {
        self.positions = MotorPositions::default();
        Ok(())
    }

    async fn move_to(&mut self, target: MotorTarget) -> Result<()> {
        // Distinct, recognizable coordinates per named target.
        let offset = match target {
            MotorTarget::Home => 0,
            MotorTarget::Mount => 1_000,
            MotorTarget::Park => 2_000,
            MotorTarget::Calibration => 3_000,
        };
        self.positions = MotorPositions {
            headbar_z: offset,
            headbar_pitch: offset,
            headbar_roll: offset,
            lickport_z: offset,
            lickport_x: offset,
            lickport_y: offset,
        };
        Ok(())
    }

    async fn restore(&mut self, positions: &MotorPositions) -> Result<()> {
        self.positions = *positions;
        Ok(())
    }

    async fn positions(&self) -> Result<MotorPositions> {
        Ok(self.positions)
    }

    async fn lock(&mut self) -> Result<()> {
        self.locked = true;
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        self.locked = false;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_motor_bank_restores_snapshots() {
        let mut motors = MockMotorBank::new();
        motors.connect().await.expect("connect");
        let snapshot = MotorPositions {
            headbar_z: 42,
            lickport_x: -7,
            ..MotorPositions::default()
        };
        motors.restore(&snapshot).await.expect("restore");
        assert_eq!(motors.positions().await.expect("positions"), snapshot);
    }

    #[tokio::test]
    async fn test_named_targets_are_distinct() {
        let mut motors = MockMotorBank::new();
        motors.move_to(MotorTarget::Mount).await.expect("mount");
        let mount = motors.positions().await.expect("positions");
        motors.move_to(MotorTarget::Park).await.expect("park");
        let park = motors.positions().await.expect("positions");
        assert_ne!(mount, park);
    }
}
