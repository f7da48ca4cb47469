/*!
Target-distribution oracle trait and a few analytic targets.

The engine only ever sees a target through [`GradientTarget`]: a joint
log-density-and-gradient evaluation plus per-parameter bounds from which the
constrained/unconstrained transform is derived. Gradients come from the
oracle itself (an autodiff backend, an analytic formula, ...); the engine
never differentiates anything.

The oracle must be deterministic for a given position within one call. It is
only ever called from the chain that owns it; run chains in parallel either
with a `Sync` target shared behind an `Arc` or with one target instance per
chain.

# Examples

```rust
use gradient_mcmc::distributions::{DiagGaussian, GradientTarget};

let target = DiagGaussian::new(vec![0.0, 1.0], vec![1.0, 2.0]);
let (logp, grad) = target.logp_and_grad(&[0.5, -0.5]).unwrap();
assert_eq!(grad.len(), 2);
assert!(logp < 0.0);
```
*/

use crate::error::{Error, Result};

/// A target distribution known through its unnormalized log-density and
/// gradient.
pub trait GradientTarget {
    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Unnormalized log-density and its gradient at `position` (constrained
    /// space).
    fn logp_and_grad(&self, position: &[f64]) -> Result<(f64, Vec<f64>)>;

    /// Per-parameter support bounds; the engine derives its bijective
    /// transform to unconstrained space from these. Defaults to fully
    /// unbounded.
    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(f64::NEG_INFINITY, f64::INFINITY); self.dim()]
    }
}

pub(crate) fn check_dim(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::Shape { expected, got });
    }
    Ok(())
}

/// Independent Gaussian target with per-dimension mean and standard
/// deviation.
#[derive(Debug, Clone)]
pub struct DiagGaussian {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl DiagGaussian {
    /// Create from mean and standard deviation vectors of equal length.
    pub fn new(mean: Vec<f64>, std: Vec<f64>) -> Self {
        assert_eq!(mean.len(), std.len(), "mean/std length mismatch");
        assert!(std.iter().all(|&s| s > 0.0), "standard deviations must be positive");
        Self { mean, std }
    }

    /// Standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self::new(vec![0.0; dim], vec![1.0; dim])
    }
}

impl GradientTarget for DiagGaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn logp_and_grad(&self, position: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dim(self.mean.len(), position.len())?;
        let mut logp = 0.0;
        let mut grad = vec![0.0; position.len()];
        for i in 0..position.len() {
            let z = (position[i] - self.mean[i]) / self.std[i];
            logp -= 0.5 * z * z;
            grad[i] = -z / self.std[i];
        }
        Ok((logp, grad))
    }
}

/// Bivariate Gaussian target with full covariance.
#[derive(Debug, Clone)]
pub struct Gaussian2D {
    mean: [f64; 2],
    // Precision matrix entries (inverse covariance).
    p00: f64,
    p01: f64,
    p11: f64,
}

impl Gaussian2D {
    /// Create from mean and covariance `[[c00, c01], [c01, c11]]`. The
    /// covariance must be symmetric positive definite.
    pub fn new(mean: [f64; 2], cov: [[f64; 2]; 2]) -> Self {
        let det = cov[0][0] * cov[1][1] - cov[0][1] * cov[1][0];
        assert!(det > 0.0 && cov[0][0] > 0.0, "covariance must be positive definite");
        Self {
            mean,
            p00: cov[1][1] / det,
            p01: -cov[0][1] / det,
            p11: cov[0][0] / det,
        }
    }
}

impl GradientTarget for Gaussian2D {
    fn dim(&self) -> usize {
        2
    }

    fn logp_and_grad(&self, position: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dim(2, position.len())?;
        let dx = position[0] - self.mean[0];
        let dy = position[1] - self.mean[1];
        let gx = self.p00 * dx + self.p01 * dy;
        let gy = self.p01 * dx + self.p11 * dy;
        let logp = -0.5 * (dx * gx + dy * gy);
        Ok((logp, vec![-gx, -gy]))
    }
}

/// The 2D Rosenbrock "banana" density, `logp = -(a-x)^2 - b (y - x^2)^2`.
#[derive(Debug, Clone, Copy)]
pub struct Rosenbrock2D {
    pub a: f64,
    pub b: f64,
}

impl GradientTarget for Rosenbrock2D {
    fn dim(&self) -> usize {
        2
    }

    fn logp_and_grad(&self, position: &[f64]) -> Result<(f64, Vec<f64>)> {
        check_dim(2, position.len())?;
        let (x, y) = (position[0], position[1]);
        let logp = -(self.a - x).powi(2) - self.b * (y - x * x).powi(2);
        let gx = 2.0 * (self.a - x) + 4.0 * self.b * x * (y - x * x);
        let gy = -2.0 * self.b * (y - x * x);
        Ok((logp, vec![gx, gy]))
    }
}
