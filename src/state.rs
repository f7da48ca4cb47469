/*!
Constrained/unconstrained bookkeeping around a target distribution.

A chain's position lives in exactly one space at a time, tagged by
[`Space`]. [`ParameterSpace`] owns the bijective transform derived from the
target's bounds and converts positions in either direction; conversions are
idempotent and carry the transform's Jacobian correction into the cached
log-density. All gradient evaluations the integrator sees go through
[`ParameterSpace::logp_and_grad_unconstrained`], which returns the corrected
density and pulled-back gradient.
*/

use crate::distributions::GradientTarget;
use crate::error::Result;
use crate::transforms::ParameterTransform;

/// Which space a position vector currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// The target's native space, respecting its bounds.
    Constrained,
    /// The space the integrator works in; all of R^n.
    Unconstrained,
}

/// A position vector tagged with its space and a cached log-density.
///
/// In unconstrained space the cached value includes the Jacobian
/// correction; in constrained space it is the raw target log-density.
#[derive(Debug, Clone)]
pub struct ParameterState {
    pub values: Vec<f64>,
    pub space: Space,
    pub logp: f64,
}

impl ParameterState {
    /// A constrained-space state with an unevaluated density.
    pub fn constrained(values: Vec<f64>) -> Self {
        Self {
            values,
            space: Space::Constrained,
            logp: f64::NAN,
        }
    }
}

/// The transform layer between a target and the sampler.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    transform: ParameterTransform,
}

impl ParameterSpace {
    /// Build from a target's declared support bounds.
    pub fn for_target<T: GradientTarget + ?Sized>(target: &T) -> Result<Self> {
        let transform = ParameterTransform::from_bounds(&target.bounds())?;
        Ok(Self { transform })
    }

    pub fn dim(&self) -> usize {
        self.transform.dim()
    }

    /// Move a state into unconstrained space. A state already there is
    /// returned unchanged.
    pub fn enter_unconstrained<T: GradientTarget + ?Sized>(
        &self,
        target: &T,
        state: ParameterState,
    ) -> Result<ParameterState> {
        if state.space == Space::Unconstrained {
            return Ok(state);
        }
        let z = self.transform.inverse(&state.values);
        let (logp, _) = self.logp_and_grad_unconstrained(target, &z)?;
        Ok(ParameterState {
            values: z,
            space: Space::Unconstrained,
            logp,
        })
    }

    /// Move a state back into constrained space. A state already there is
    /// returned unchanged.
    pub fn return_to_constrained<T: GradientTarget + ?Sized>(
        &self,
        target: &T,
        state: ParameterState,
    ) -> Result<ParameterState> {
        if state.space == Space::Constrained {
            return Ok(state);
        }
        let x = self.transform.forward(&state.values);
        let (logp, _) = target.logp_and_grad(&x)?;
        Ok(ParameterState {
            values: x,
            space: Space::Constrained,
            logp,
        })
    }

    /// Map an unconstrained position to constrained values without
    /// re-evaluating the target.
    pub fn constrain_values(&self, z: &[f64]) -> Vec<f64> {
        self.transform.forward(z)
    }

    /// Total log-Jacobian of the transform at unconstrained `z`.
    pub fn log_jacobian(&self, z: &[f64]) -> f64 {
        self.transform.log_abs_det_jacobian(z)
    }

    /// Jacobian-corrected log-density and gradient at unconstrained `z`.
    ///
    /// A non-finite target density yields `-inf` with a zero gradient so
    /// that the integrator can flag a divergence rather than poisoning the
    /// chain with NaN. An `Err` from the oracle itself stays an error.
    pub fn logp_and_grad_unconstrained<T: GradientTarget + ?Sized>(
        &self,
        target: &T,
        z: &[f64],
    ) -> Result<(f64, Vec<f64>)> {
        let x = self.transform.forward(z);
        let (logp_x, grad_x) = target.logp_and_grad(&x)?;
        if !logp_x.is_finite() {
            return Ok((f64::NEG_INFINITY, vec![0.0; z.len()]));
        }
        if self.transform.is_identity() {
            return Ok((logp_x, grad_x));
        }
        let logp = logp_x + self.transform.log_abs_det_jacobian(z);
        let grad = self.transform.chain_gradient(z, &grad_x);
        Ok((logp, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DiagGaussian;
    use approx::assert_abs_diff_eq;
    use crate::error::Error;

    struct HalfNormal;

    impl GradientTarget for HalfNormal {
        fn dim(&self) -> usize {
            1
        }
        fn logp_and_grad(&self, position: &[f64]) -> Result<(f64, Vec<f64>)> {
            let x = position[0];
            if x <= 0.0 {
                return Ok((f64::NEG_INFINITY, vec![0.0]));
            }
            Ok((-0.5 * x * x, vec![-x]))
        }
        fn bounds(&self) -> Vec<(f64, f64)> {
            vec![(0.0, f64::INFINITY)]
        }
    }

    #[test]
    fn enter_and_return_round_trip() {
        let target = HalfNormal;
        let space = ParameterSpace::for_target(&target).unwrap();
        let state = ParameterState::constrained(vec![1.5]);
        let u = space.enter_unconstrained(&target, state).unwrap();
        assert_eq!(u.space, Space::Unconstrained);
        assert_abs_diff_eq!(u.values[0], 1.5f64.ln(), epsilon = 1e-12);
        // Idempotent.
        let u2 = space.enter_unconstrained(&target, u.clone()).unwrap();
        assert_eq!(u2.values, u.values);
        let c = space.return_to_constrained(&target, u).unwrap();
        assert_eq!(c.space, Space::Constrained);
        assert_abs_diff_eq!(c.values[0], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(c.logp, -0.5 * 1.5 * 1.5, epsilon = 1e-12);
    }

    #[test]
    fn unconstrained_logp_includes_jacobian() {
        let target = HalfNormal;
        let space = ParameterSpace::for_target(&target).unwrap();
        let z = 0.4;
        let (logp, grad) = space
            .logp_and_grad_unconstrained(&target, &[z])
            .unwrap();
        let x = z.exp();
        assert_abs_diff_eq!(logp, -0.5 * x * x + z, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[0], -x * x + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn identity_space_passes_through() {
        let target = DiagGaussian::standard(2);
        let space = ParameterSpace::for_target(&target).unwrap();
        let (logp, grad) = space
            .logp_and_grad_unconstrained(&target, &[1.0, -2.0])
            .unwrap();
        assert_abs_diff_eq!(logp, -0.5 * (1.0 + 4.0), epsilon = 1e-12);
        assert_eq!(grad, vec![-1.0, 2.0]);
    }

    #[test]
    fn non_finite_density_becomes_neg_inf() {
        struct Bad;
        impl GradientTarget for Bad {
            fn dim(&self) -> usize {
                1
            }
            fn logp_and_grad(&self, _p: &[f64]) -> Result<(f64, Vec<f64>)> {
                Ok((f64::NAN, vec![f64::NAN]))
            }
        }
        let space = ParameterSpace::for_target(&Bad).unwrap();
        let (logp, grad) = space.logp_and_grad_unconstrained(&Bad, &[0.0]).unwrap();
        assert_eq!(logp, f64::NEG_INFINITY);
        assert_eq!(grad, vec![0.0]);
    }

    #[test]
    fn oracle_errors_propagate() {
        struct Failing;
        impl GradientTarget for Failing {
            fn dim(&self) -> usize {
                1
            }
            fn logp_and_grad(&self, _p: &[f64]) -> Result<(f64, Vec<f64>)> {
                Err(Error::Oracle("backend unavailable".into()))
            }
        }
        let space = ParameterSpace::for_target(&Failing).unwrap();
        assert!(space
            .logp_and_grad_unconstrained(&Failing, &[0.0])
            .is_err());
    }
}
