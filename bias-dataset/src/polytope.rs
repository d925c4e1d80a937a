//! Cross-polytope of bias perturbations around a base aberration.

use crate::config::ConfigError;

/// Base vector followed by its ± perturbations along each axis.
///
/// For every axis in order, the `+step` perturbations for all `steps` come
/// first, then the `-step` perturbations. The result holds
/// `1 + 2 * axes.len() * steps.len()` vectors, each the length of `base`.
///
/// # Errors
/// [`ConfigError::AxisOutOfRange`] if an axis does not index into `base`.
pub fn make_bias_polytope(
    base: &[f64],
    axes: &[usize],
    steps: &[f64],
) -> Result<Vec<Vec<f64>>, ConfigError> {
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= base.len()) {
        return Err(ConfigError::AxisOutOfRange {
            axis,
            len: base.len(),
        });
    }

    let mut vectors = Vec::with_capacity(1 + 2 * axes.len() * steps.len());
    vectors.push(base.to_vec());

    for &axis in axes {
        for sign in [1.0, -1.0] {
            for &step in steps {
                let mut offset = base.to_vec();
                offset[axis] += sign * step;
                vectors.push(offset);
            }
        }
    }

    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_two_axes_single_step_order() {
        let base = vec![0.0, 0.5, 0.0];
        let vectors = make_bias_polytope(&base, &[0, 2], &[1.0]).unwrap();

        assert_eq!(
            vectors,
            vec![
                vec![0.0, 0.5, 0.0],
                vec![1.0, 0.5, 0.0],
                vec![-1.0, 0.5, 0.0],
                vec![0.0, 0.5, 1.0],
                vec![0.0, 0.5, -1.0],
            ]
        );
    }

    #[test]
    fn test_multiple_steps_plus_block_then_minus_block() {
        let vectors = make_bias_polytope(&[0.0, 0.0], &[1], &[1.0, 2.0]).unwrap();
        let axis_values: Vec<f64> = vectors.iter().map(|v| v[1]).collect();
        assert_eq!(axis_values, vec![0.0, 1.0, 2.0, -1.0, -2.0]);
    }

    #[test]
    fn test_count_and_single_axis_perturbation() {
        let base: Vec<f64> = (0..11).map(|i| i as f64 * 0.1).collect();
        let axes = [4, 5, 6, 7, 10];
        let vectors = make_bias_polytope(&base, &axes, &[0.5]).unwrap();
        assert_eq!(vectors.len(), 1 + 2 * axes.len());

        for vector in &vectors[1..] {
            let changed: Vec<usize> = (0..base.len())
                .filter(|&i| (vector[i] - base[i]).abs() > 1e-12)
                .collect();
            assert_eq!(changed.len(), 1);
            assert!(axes.contains(&changed[0]));
            assert_abs_diff_eq!((vector[changed[0]] - base[changed[0]]).abs(), 0.5);
        }
    }

    #[test]
    fn test_no_axes_yields_base_only() {
        let vectors = make_bias_polytope(&[1.0, 2.0], &[], &[1.0]).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn test_axis_out_of_range() {
        assert_eq!(
            make_bias_polytope(&[0.0; 4], &[2, 4], &[1.0]),
            Err(ConfigError::AxisOutOfRange { axis: 4, len: 4 })
        );
    }
}
