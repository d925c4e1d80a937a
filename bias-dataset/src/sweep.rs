//! Lazy traversal of the (area, applied mode, applied step) sweep.
//!
//! The running aberration vector lives in [`SweepState`] and is mutated by
//! [`sweep_step`]: each step overwrites only the slot of the current applied
//! mode, so slots set by earlier steps keep their last value.

use tracing::error;

use crate::config::{ConfigError, SweepConfig};
use crate::polytope::make_bias_polytope;

/// One repetition's worth of sweep output
#[derive(Debug, Clone, PartialEq)]
pub struct SweepItem {
    /// Aberration vectors to apply, one capture each
    pub bias_list: Vec<Vec<f64>>,
    /// Stable, filesystem-safe name fragment for this (area, mode, step)
    pub file_prefix: String,
    /// First item of an area other than the first
    pub is_new_area: bool,
    pub area: usize,
    pub applied_mode: usize,
    pub step_index: usize,
    pub step: f64,
}

/// Mutable aberration vector carried across sweep steps
#[derive(Debug, Clone, PartialEq)]
pub struct SweepState {
    start_aberrations: Vec<f64>,
}

impl SweepState {
    pub fn new(len: usize) -> Self {
        Self {
            start_aberrations: vec![0.0; len],
        }
    }

    pub fn start_aberrations(&self) -> &[f64] {
        &self.start_aberrations
    }
}

/// Set `applied_mode` to `step` and build the bias polytope around the result.
pub fn sweep_step(
    state: &mut SweepState,
    bias_modes: &[usize],
    bias_steps: &[f64],
    applied_mode: usize,
    step: f64,
) -> Result<Vec<Vec<f64>>, ConfigError> {
    let len = state.start_aberrations.len();
    let slot = state
        .start_aberrations
        .get_mut(applied_mode)
        .ok_or(ConfigError::AxisOutOfRange {
            axis: applied_mode,
            len,
        })?;
    *slot = step;
    make_bias_polytope(&state.start_aberrations, bias_modes, bias_steps)
}

/// File-name fragment for one sweep position, e.g. `A0M4S2_+0p000`.
///
/// The step index keeps prefixes distinct even when two amplitudes round to
/// the same printed value.
pub fn file_prefix(area: usize, applied_mode: usize, step_index: usize, step: f64) -> String {
    format!("A{area}M{applied_mode}S{step_index}_{step:+.3}").replace('.', "p")
}

/// Single-pass iterator over the sweep: areas, then applied modes, then steps.
#[derive(Debug, Clone)]
pub struct ParameterSweepGenerator {
    bias_modes: Vec<usize>,
    bias_steps: Vec<f64>,
    applied_modes: Vec<usize>,
    applied_steps: Vec<f64>,
    areas: usize,
    state: SweepState,
    cursor: usize,
}

impl ParameterSweepGenerator {
    pub fn new(config: &SweepConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            bias_modes: config.bias_modes.clone(),
            bias_steps: config.bias_steps.clone(),
            applied_modes: config.applied_modes.clone(),
            applied_steps: config.applied_steps(),
            areas: config.areas,
            state: SweepState::new(config.mode_vector_len()?),
            cursor: 0,
        })
    }

    /// Total number of items the sweep yields
    pub fn total(&self) -> usize {
        self.applied_steps.len() * self.applied_modes.len() * self.areas
    }

    pub fn applied_steps(&self) -> &[f64] {
        &self.applied_steps
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }
}

impl Iterator for ParameterSweepGenerator {
    type Item = SweepItem;

    fn next(&mut self) -> Option<SweepItem> {
        if self.cursor >= self.total() {
            return None;
        }

        let steps = self.applied_steps.len();
        let per_area = steps * self.applied_modes.len();
        let area = self.cursor / per_area;
        let mode_index = (self.cursor / steps) % self.applied_modes.len();
        let step_index = self.cursor % steps;
        self.cursor += 1;

        let applied_mode = self.applied_modes[mode_index];
        let step = self.applied_steps[step_index];
        let bias_list = match sweep_step(
            &mut self.state,
            &self.bias_modes,
            &self.bias_steps,
            applied_mode,
            step,
        ) {
            Ok(bias_list) => bias_list,
            Err(e) => {
                error!("Sweep stopped: {}", e);
                self.cursor = self.total();
                return None;
            }
        };

        Some(SweepItem {
            bias_list,
            file_prefix: file_prefix(area, applied_mode, step_index, step),
            is_new_area: area > 0 && mode_index == 0 && step_index == 0,
            area,
            applied_mode,
            step_index,
            step,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.cursor);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ParameterSweepGenerator {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::collections::HashSet;

    fn config(bias_modes: Vec<usize>, applied_modes: Vec<usize>, applied_step: usize, areas: usize) -> SweepConfig {
        SweepConfig {
            bias_modes,
            applied_modes,
            applied_step,
            areas,
            abb_magnitude: 5.0,
            ..SweepConfig::default()
        }
    }

    #[test]
    fn test_small_sweep_shape() {
        let sweep = ParameterSweepGenerator::new(&config(vec![4, 5], vec![4], 3, 1)).unwrap();
        assert_eq!(sweep.len(), 3);

        let items: Vec<SweepItem> = sweep.collect();
        assert_eq!(items.len(), 3);
        assert!(!items[0].is_new_area);
        for item in &items {
            assert_eq!(item.bias_list.len(), 5);
            assert_eq!(item.bias_list[0].len(), 6);
        }
        let steps: Vec<f64> = items.iter().map(|i| i.step).collect();
        assert_eq!(steps, vec![-5.0, 0.0, 5.0]);
    }

    #[test]
    fn test_single_applied_step_is_negative_magnitude() {
        let items: Vec<SweepItem> =
            ParameterSweepGenerator::new(&config(vec![4], vec![4, 6], 1, 1))
                .unwrap()
                .collect();
        assert_eq!(items.len(), 2);
        for item in &items {
            assert_abs_diff_eq!(item.step, -5.0);
        }
    }

    #[test]
    fn test_traversal_order_area_mode_step() {
        let items: Vec<(usize, usize, usize)> =
            ParameterSweepGenerator::new(&config(vec![4], vec![6, 5], 2, 2))
                .unwrap()
                .map(|i| (i.area, i.applied_mode, i.step_index))
                .collect();
        assert_eq!(
            items,
            vec![
                (0, 6, 0),
                (0, 6, 1),
                (0, 5, 0),
                (0, 5, 1),
                (1, 6, 0),
                (1, 6, 1),
                (1, 5, 0),
                (1, 5, 1),
            ]
        );
    }

    #[test]
    fn test_new_area_flag_once_per_boundary() {
        let flags: Vec<bool> = ParameterSweepGenerator::new(&config(vec![4], vec![4, 5], 2, 3))
            .unwrap()
            .map(|i| i.is_new_area)
            .collect();
        let raised: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| f.then_some(i))
            .collect();
        assert_eq!(raised, vec![4, 8]);
    }

    #[test]
    fn test_start_vector_persists_across_modes() {
        let mut sweep = ParameterSweepGenerator::new(&config(vec![4], vec![5, 6], 2, 1)).unwrap();

        // Mode 5 ends at +5 and keeps that value while mode 6 is swept
        let items: Vec<SweepItem> = sweep.by_ref().collect();
        let base_of_mode_6 = &items[2].bias_list[0];
        assert_abs_diff_eq!(base_of_mode_6[5], 5.0);
        assert_abs_diff_eq!(base_of_mode_6[6], -5.0);
        assert_abs_diff_eq!(sweep.state().start_aberrations()[6], 5.0);
    }

    #[test]
    fn test_sweep_step_overwrites_single_slot() {
        let mut state = SweepState::new(5);
        sweep_step(&mut state, &[1], &[1.0], 2, 0.5).unwrap();
        let list = sweep_step(&mut state, &[1], &[1.0], 3, -0.25).unwrap();
        assert_eq!(state.start_aberrations(), &[0.0, 0.0, 0.5, -0.25, 0.0]);
        assert_eq!(list[1], vec![0.0, 1.0, 0.5, -0.25, 0.0]);

        assert!(sweep_step(&mut state, &[1], &[1.0], 9, 1.0).is_err());
    }

    #[test]
    fn test_file_prefixes_unique_and_safe() {
        let items: Vec<SweepItem> =
            ParameterSweepGenerator::new(&config(vec![4, 5, 6, 7, 10], vec![4, 5, 6, 7, 10], 50, 2))
                .unwrap()
                .collect();
        let prefixes: HashSet<&str> = items.iter().map(|i| i.file_prefix.as_str()).collect();
        assert_eq!(prefixes.len(), items.len());
        for prefix in prefixes {
            assert!(prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "+-_".contains(c)));
        }
    }

    #[test]
    fn test_file_prefix_format() {
        assert_eq!(file_prefix(0, 4, 0, -5.0), "A0M4S0_-5p000");
        assert_eq!(file_prefix(1, 10, 2, 0.0), "A1M10S2_+0p000");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ParameterSweepGenerator::new(&config(vec![], vec![4], 3, 1)).is_err());
    }

    #[test]
    fn test_huge_mode_index_rejected_without_allocating() {
        let result = ParameterSweepGenerator::new(&config(vec![usize::MAX], vec![4], 3, 1));
        assert!(matches!(
            result,
            Err(ConfigError::ModeOutOfRange {
                field: "bias_modes",
                ..
            })
        ));
        assert!(ParameterSweepGenerator::new(&config(vec![4], vec![1_000_000], 3, 1)).is_err());
    }

    #[test]
    fn test_size_hint_counts_down() {
        let mut sweep = ParameterSweepGenerator::new(&config(vec![4], vec![4], 3, 2)).unwrap();
        assert_eq!(sweep.size_hint(), (6, Some(6)));
        sweep.next();
        assert_eq!(sweep.len(), 5);
        sweep.by_ref().for_each(drop);
        assert_eq!(sweep.next(), None);
    }
}
