//! In-process doubles for the hardware traits.
//!
//! The mirror and stage mocks are cheap to clone and every clone shares the
//! same state, so a test can hand one clone to the code under test and keep
//! another to inspect what happened.

use crate::{
    AberrationInterface, DeviceError, DeviceResult, DiskPosition, SectioningUnit, StageInterface,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct MirrorState {
    applied: Vec<Vec<f64>>,
    queued: Vec<Vec<f64>>,
    writes: usize,
    fail_on: HashSet<usize>,
}

/// Deformable mirror that records every applied vector
#[derive(Debug, Clone)]
pub struct MockMirror {
    state: Arc<Mutex<MirrorState>>,
    movement_time: Duration,
}

impl Default for MockMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMirror {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MirrorState::default())),
            movement_time: Duration::from_millis(1),
        }
    }

    pub fn with_movement_time(mut self, movement_time: Duration) -> Self {
        self.movement_time = movement_time;
        self
    }

    /// Reject the given `set_phase` calls (zero-based, counted across the mirror's life)
    pub fn fail_on(self, writes: impl IntoIterator<Item = usize>) -> Self {
        self.state.lock().unwrap().fail_on.extend(writes);
        self
    }

    /// Vectors accepted by `set_phase`, in order
    pub fn applied(&self) -> Vec<Vec<f64>> {
        self.state.lock().unwrap().applied.clone()
    }

    /// Patterns loaded by the last `queue_patterns`
    pub fn queued(&self) -> Vec<Vec<f64>> {
        self.state.lock().unwrap().queued.clone()
    }

    /// Number of `set_phase` calls, accepted or not
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }
}

impl AberrationInterface for MockMirror {
    fn set_phase(&mut self, coefficients: &[f64]) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let write = state.writes;
        state.writes += 1;

        if state.fail_on.contains(&write) {
            return Err(DeviceError::Communication(format!(
                "mirror write {write} lost"
            )));
        }
        state.applied.push(coefficients.to_vec());
        Ok(())
    }

    fn queue_patterns(&mut self, patterns: &[Vec<f64>]) -> DeviceResult<()> {
        if patterns.is_empty() {
            return Err(DeviceError::Rejected("empty pattern list".to_string()));
        }
        debug!("Queued {} mirror patterns", patterns.len());
        self.state.lock().unwrap().queued = patterns.to_vec();
        Ok(())
    }

    fn movement_time(&self) -> Duration {
        self.movement_time
    }
}

#[derive(Debug)]
struct ClarityState {
    enabled: bool,
    channel: usize,
    channel_moving_reads: usize,
    disk: DiskPosition,
    disk_moving_reads: usize,
    door_closed: bool,
    led: bool,
    failing: bool,
}

/// Sectioning unit whose turret and disk report "moving" for a few reads
/// after every move
#[derive(Debug)]
pub struct MockClarity {
    state: Mutex<ClarityState>,
    settle_reads: usize,
}

impl Default for MockClarity {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClarity {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClarityState {
                enabled: false,
                channel: 0,
                channel_moving_reads: 0,
                disk: DiskPosition::Bypass,
                disk_moving_reads: 0,
                door_closed: true,
                led: false,
                failing: false,
            }),
            settle_reads: 0,
        }
    }

    /// Number of position reads answered with `None` after each move
    pub fn with_settle_reads(mut self, reads: usize) -> Self {
        self.settle_reads = reads;
        self
    }

    /// Operator-side door change
    pub fn set_door_closed(&self, closed: bool) {
        self.state.lock().unwrap().door_closed = closed;
    }

    /// Make every query fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    fn check(&self, state: &ClarityState) -> DeviceResult<()> {
        if state.failing {
            Err(DeviceError::Communication("clarity unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SectioningUnit for MockClarity {
    fn get_channel_position(&self) -> DeviceResult<Option<usize>> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        if state.channel_moving_reads > 0 {
            state.channel_moving_reads -= 1;
            return Ok(None);
        }
        Ok(Some(state.channel))
    }

    fn set_channel_position(&self, channel: usize) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        if channel >= 4 {
            return Err(DeviceError::OutOfRange(format!("channel {channel}")));
        }
        state.channel = channel;
        state.channel_moving_reads = self.settle_reads;
        Ok(())
    }

    fn get_disk_position(&self) -> DeviceResult<Option<DiskPosition>> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        if state.disk_moving_reads > 0 {
            state.disk_moving_reads -= 1;
            return Ok(None);
        }
        Ok(Some(state.disk))
    }

    fn set_disk_position(&self, position: DiskPosition) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        state.disk = position;
        state.disk_moving_reads = self.settle_reads;
        Ok(())
    }

    fn get_is_enabled(&self) -> DeviceResult<bool> {
        let state = self.state.lock().unwrap();
        self.check(&state)?;
        Ok(state.enabled)
    }

    fn enable(&self) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        state.enabled = true;
        Ok(())
    }

    fn disable(&self) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        state.enabled = false;
        Ok(())
    }

    fn door_closed(&self) -> DeviceResult<bool> {
        let state = self.state.lock().unwrap();
        self.check(&state)?;
        Ok(state.door_closed)
    }

    fn calibration_led(&self) -> DeviceResult<bool> {
        let state = self.state.lock().unwrap();
        self.check(&state)?;
        Ok(state.led)
    }

    fn set_calibration_led(&self, on: bool) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        state.led = on;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StageState {
    position: (f64, f64, f64),
    moves: Vec<(f64, f64)>,
    failing: bool,
}

/// XY stage that moves instantly and records every target
#[derive(Debug, Clone, Default)]
pub struct MockStage {
    state: Arc<Mutex<StageState>>,
}

impl MockStage {
    pub fn new(x_um: f64, y_um: f64, z_um: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(StageState {
                position: (x_um, y_um, z_um),
                ..StageState::default()
            })),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// XY targets of completed moves, in order
    pub fn moves(&self) -> Vec<(f64, f64)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub fn position(&self) -> (f64, f64, f64) {
        self.state.lock().unwrap().position
    }
}

impl StageInterface for MockStage {
    fn get_position(&mut self) -> DeviceResult<(f64, f64, f64)> {
        let state = self.state.lock().unwrap();
        if state.failing {
            return Err(DeviceError::Communication("stage unreachable".to_string()));
        }
        Ok(state.position)
    }

    fn go_to_xy(&mut self, x_um: f64, y_um: f64) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(DeviceError::Communication("stage unreachable".to_string()));
        }
        state.position.0 = x_um;
        state.position.1 = y_um;
        state.moves.push((x_um, y_um));
        Ok(())
    }
}
