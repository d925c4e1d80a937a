//! Hardware-timed variant of the dataset run.
//!
//! Instead of pushing each bias vector and waiting for a frame, the whole
//! sweep is flattened into one pattern list that the mirror steps through on
//! triggers, and a timeline of toggles and exposures is built to drive it.

use std::time::Duration;

use hardware::AberrationInterface;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ConfigError;
use crate::error::ExperimentError;
use crate::sweep::ParameterSweepGenerator;

/// Extra settling allowed after each mirror toggle
pub const MIRROR_SETTLE: Duration = Duration::from_millis(1);

/// Delay between the mirror settling and the start of imaging
pub const PRE_IMAGING_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    /// Advance the mirror to the next queued pattern
    ToggleMirror { pattern_index: usize },
    /// Expose one camera
    Expose { camera: String, duration: Duration },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedAction {
    /// Offset from the start of the run
    pub time: Duration,
    pub action: Action,
}

/// Cameras exposed together for the same duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSetting {
    pub cameras: Vec<String>,
    pub exposure: Duration,
}

/// Time-ordered list of actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionTable {
    actions: Vec<TimedAction>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, time: Duration, action: Action) {
        self.actions.push(TimedAction { time, action });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimedAction> {
        self.actions.iter()
    }

    /// Time of the last action, zero for an empty table
    pub fn last_time(&self) -> Duration {
        self.actions.last().map_or(Duration::ZERO, |a| a.time)
    }

    pub fn toggle_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.action, Action::ToggleMirror { .. }))
            .count()
    }

    pub fn exposure_count(&self) -> usize {
        self.actions.len() - self.toggle_count()
    }
}

/// Where one repetition sits in the queued plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRep {
    pub file_prefix: String,
    pub is_new_area: bool,
    /// Index of this repetition's first pattern in [`QueuedPlan::patterns`]
    pub first_pattern: usize,
    pub pattern_count: usize,
    pub start: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPlan {
    pub patterns: Vec<Vec<f64>>,
    pub table: ActionTable,
    pub reps: Vec<PlannedRep>,
}

/// Drain `sweep` into a single pattern list and its action timeline.
///
/// Every pattern gets a toggle at `t`, after which `t` advances by the
/// mirror's movement time, [`MIRROR_SETTLE`] and [`PRE_IMAGING_DELAY`].
/// Each exposure group then fires at `t` and `t` advances by its exposure.
/// Consecutive repetitions start at least `rep_duration` apart.
///
/// # Errors
/// [`ConfigError::Empty`] if `exposures` is empty or a group has no cameras.
pub fn plan_queued_run(
    sweep: ParameterSweepGenerator,
    movement_time: Duration,
    exposures: &[ExposureSetting],
    rep_duration: Duration,
) -> Result<QueuedPlan, ExperimentError> {
    if exposures.is_empty() || exposures.iter().any(|e| e.cameras.is_empty()) {
        return Err(ConfigError::Empty { field: "exposures" }.into());
    }

    let toggle_step = movement_time + MIRROR_SETTLE + PRE_IMAGING_DELAY;
    let mut patterns = Vec::new();
    let mut table = ActionTable::new();
    let mut reps = Vec::with_capacity(sweep.len());
    let mut t = Duration::ZERO;

    for item in sweep {
        let start = t;
        let first_pattern = patterns.len();

        for bias in item.bias_list.iter() {
            table.add(
                t,
                Action::ToggleMirror {
                    pattern_index: patterns.len(),
                },
            );
            patterns.push(bias.clone());
            t += toggle_step;

            for setting in exposures {
                for camera in &setting.cameras {
                    table.add(
                        t,
                        Action::Expose {
                            camera: camera.clone(),
                            duration: setting.exposure,
                        },
                    );
                }
                t += setting.exposure;
            }
        }

        reps.push(PlannedRep {
            file_prefix: item.file_prefix,
            is_new_area: item.is_new_area,
            first_pattern,
            pattern_count: item.bias_list.len(),
            start,
        });
        t = t.max(start + rep_duration);
    }

    info!(
        "Planned {} patterns over {} reps, {} actions ending at {:.3}s",
        patterns.len(),
        reps.len(),
        table.len(),
        table.last_time().as_secs_f64()
    );
    Ok(QueuedPlan {
        patterns,
        table,
        reps,
    })
}

/// Load every pattern of `plan` onto the mirror in one call
pub fn queue_plan<M: AberrationInterface + ?Sized>(
    mirror: &mut M,
    plan: &QueuedPlan,
) -> Result<(), ExperimentError> {
    mirror
        .queue_patterns(&plan.patterns)
        .map_err(ExperimentError::QueueRejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use hardware::mock::MockMirror;

    fn small_sweep() -> ParameterSweepGenerator {
        let config = SweepConfig {
            bias_modes: vec![4, 5],
            applied_modes: vec![4],
            applied_step: 3,
            ..SweepConfig::default()
        };
        ParameterSweepGenerator::new(&config).unwrap()
    }

    fn one_camera(ms: u64) -> Vec<ExposureSetting> {
        vec![ExposureSetting {
            cameras: vec!["cam".to_string()],
            exposure: Duration::from_millis(ms),
        }]
    }

    #[test]
    fn test_plan_counts() {
        let plan = plan_queued_run(
            small_sweep(),
            Duration::from_millis(2),
            &one_camera(10),
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(plan.patterns.len(), 15);
        assert_eq!(plan.reps.len(), 3);
        assert_eq!(plan.table.toggle_count(), 15);
        assert_eq!(plan.table.exposure_count(), 15);
        assert_eq!(plan.reps[1].first_pattern, 5);
        assert_eq!(plan.reps[2].pattern_count, 5);
    }

    #[test]
    fn test_toggle_and_exposure_timing() {
        let plan = plan_queued_run(
            small_sweep(),
            Duration::from_millis(2),
            &one_camera(10),
            Duration::ZERO,
        )
        .unwrap();

        let times: Vec<(Duration, &Action)> =
            plan.table.iter().take(4).map(|a| (a.time, &a.action)).collect();
        assert_eq!(times[0].0, Duration::ZERO);
        assert_eq!(times[0].1, &Action::ToggleMirror { pattern_index: 0 });
        // 2 ms movement + 1 ms settle + 1 ms delay
        assert_eq!(times[1].0, Duration::from_millis(4));
        assert!(matches!(times[1].1, Action::Expose { .. }));
        assert_eq!(times[2].0, Duration::from_millis(14));
        assert_eq!(times[2].1, &Action::ToggleMirror { pattern_index: 1 });
        assert_eq!(times[3].0, Duration::from_millis(18));
    }

    #[test]
    fn test_exposure_groups_run_back_to_back() {
        let exposures = vec![
            ExposureSetting {
                cameras: vec!["a".to_string(), "b".to_string()],
                exposure: Duration::from_millis(5),
            },
            ExposureSetting {
                cameras: vec!["c".to_string()],
                exposure: Duration::from_millis(20),
            },
        ];
        let plan = plan_queued_run(small_sweep(), Duration::ZERO, &exposures, Duration::ZERO)
            .unwrap();

        let first: Vec<&TimedAction> = plan.table.iter().take(5).collect();
        assert_eq!(first[1].time, Duration::from_millis(2));
        assert_eq!(first[2].time, Duration::from_millis(2));
        assert_eq!(first[3].time, Duration::from_millis(7));
        assert_eq!(first[4].time, Duration::from_millis(27));
    }

    #[test]
    fn test_rep_duration_spaces_blocks() {
        let plan = plan_queued_run(
            small_sweep(),
            Duration::ZERO,
            &one_camera(1),
            Duration::from_secs(4),
        )
        .unwrap();
        let starts: Vec<Duration> = plan.reps.iter().map(|r| r.start).collect();
        assert_eq!(
            starts,
            vec![
                Duration::ZERO,
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn test_requires_exposures() {
        let result = plan_queued_run(small_sweep(), Duration::ZERO, &[], Duration::ZERO);
        assert!(matches!(
            result,
            Err(ExperimentError::Configuration(ConfigError::Empty { .. }))
        ));
    }

    #[test]
    fn test_queue_plan_loads_all_patterns() {
        let plan =
            plan_queued_run(small_sweep(), Duration::ZERO, &one_camera(1), Duration::ZERO).unwrap();
        let mirror = MockMirror::new();
        let mut driver = mirror.clone();
        queue_plan(&mut driver, &plan).unwrap();
        assert_eq!(mirror.queued(), plan.patterns);
    }

    #[test]
    fn test_table_serializes_tagged() {
        let mut table = ActionTable::new();
        table.add(Duration::ZERO, Action::ToggleMirror { pattern_index: 3 });
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.contains(r#""type":"ToggleMirror""#));
    }
}
