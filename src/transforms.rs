/*!
Bijective transforms between constrained parameter space and the
unconstrained space the integrator works in.

Each parameter gets a bijector chosen from its support bounds: unbounded
parameters map through the identity, half-bounded ones through exp shifts,
and interval-bounded ones through a scaled sigmoid. The log-Jacobian of the
map is added to the target log-density so that sampling in unconstrained
space targets the correct constrained distribution.
*/

use crate::error::{Error, Result};

/// A smooth invertible map for one scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bijector {
    /// Unbounded support; `x = z`.
    Identity,
    /// Support `(lower, inf)`; `x = lower + exp(z)`.
    LowerBounded(f64),
    /// Support `(-inf, upper)`; `x = upper - exp(z)`.
    UpperBounded(f64),
    /// Support `(lower, upper)`; `x = lower + (upper - lower) * sigmoid(z)`.
    Interval { lower: f64, upper: f64 },
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn log_sigmoid(z: f64) -> f64 {
    // log(sigmoid(z)), stable for large |z|.
    if z >= 0.0 {
        -(-z).exp().ln_1p()
    } else {
        z - z.exp().ln_1p()
    }
}

impl Bijector {
    /// Map unconstrained `z` to constrained `x`.
    pub fn forward(&self, z: f64) -> f64 {
        match *self {
            Bijector::Identity => z,
            Bijector::LowerBounded(lower) => lower + z.exp(),
            Bijector::UpperBounded(upper) => upper - z.exp(),
            Bijector::Interval { lower, upper } => lower + (upper - lower) * sigmoid(z),
        }
    }

    /// Map constrained `x` back to unconstrained `z`. `x` must lie strictly
    /// inside the support.
    pub fn inverse(&self, x: f64) -> f64 {
        match *self {
            Bijector::Identity => x,
            Bijector::LowerBounded(lower) => (x - lower).ln(),
            Bijector::UpperBounded(upper) => (upper - x).ln(),
            Bijector::Interval { lower, upper } => {
                let u = (x - lower) / (upper - lower);
                (u / (1.0 - u)).ln()
            }
        }
    }

    /// `log |dx/dz|` at `z`.
    pub fn log_abs_det_jacobian(&self, z: f64) -> f64 {
        match *self {
            Bijector::Identity => 0.0,
            Bijector::LowerBounded(_) | Bijector::UpperBounded(_) => z,
            Bijector::Interval { lower, upper } => {
                // d/dz [l + (u-l) sigmoid(z)] = (u-l) sigmoid(z) sigmoid(-z)
                (upper - lower).ln() + log_sigmoid(z) + log_sigmoid(-z)
            }
        }
    }

    /// `d log|dx/dz| / dz` at `z`, used to chain gradients through the map.
    pub fn log_jacobian_grad(&self, z: f64) -> f64 {
        match *self {
            Bijector::Identity => 0.0,
            Bijector::LowerBounded(_) | Bijector::UpperBounded(_) => 1.0,
            Bijector::Interval { .. } => 1.0 - 2.0 * sigmoid(z),
        }
    }

    /// `dx/dz` at `z`.
    pub fn forward_grad(&self, z: f64) -> f64 {
        match *self {
            Bijector::Identity => 1.0,
            Bijector::LowerBounded(_) => z.exp(),
            Bijector::UpperBounded(_) => -z.exp(),
            Bijector::Interval { lower, upper } => {
                let s = sigmoid(z);
                (upper - lower) * s * (1.0 - s)
            }
        }
    }
}

/// Per-parameter bijectors for a whole parameter vector.
#[derive(Debug, Clone)]
pub struct ParameterTransform {
    bijectors: Vec<Bijector>,
    identity: bool,
}

impl ParameterTransform {
    /// Derive a transform from `(lower, upper)` support bounds, one pair per
    /// parameter. Infinite bounds select the identity / half-bounded maps.
    pub fn from_bounds(bounds: &[(f64, f64)]) -> Result<Self> {
        let mut bijectors = Vec::with_capacity(bounds.len());
        for &(lower, upper) in bounds {
            if lower >= upper {
                return Err(Error::Config(format!(
                    "invalid bounds ({lower}, {upper}): lower must be below upper"
                )));
            }
            let b = match (lower.is_finite(), upper.is_finite()) {
                (false, false) => Bijector::Identity,
                (true, false) => Bijector::LowerBounded(lower),
                (false, true) => Bijector::UpperBounded(upper),
                (true, true) => Bijector::Interval { lower, upper },
            };
            bijectors.push(b);
        }
        let identity = bijectors.iter().all(|b| *b == Bijector::Identity);
        Ok(Self { bijectors, identity })
    }

    pub fn dim(&self) -> usize {
        self.bijectors.len()
    }

    /// True when every parameter is unbounded, i.e. the transform is a
    /// no-op.
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn forward(&self, z: &[f64]) -> Vec<f64> {
        self.bijectors
            .iter()
            .zip(z)
            .map(|(b, &zi)| b.forward(zi))
            .collect()
    }

    pub fn inverse(&self, x: &[f64]) -> Vec<f64> {
        self.bijectors
            .iter()
            .zip(x)
            .map(|(b, &xi)| b.inverse(xi))
            .collect()
    }

    /// Total `log |det dx/dz|` at `z`.
    pub fn log_abs_det_jacobian(&self, z: &[f64]) -> f64 {
        self.bijectors
            .iter()
            .zip(z)
            .map(|(b, &zi)| b.log_abs_det_jacobian(zi))
            .sum()
    }

    /// Pull the constrained-space gradient `dlogp/dx` back to unconstrained
    /// space, adding the Jacobian-correction gradient:
    /// `dlogp_u/dz_i = dlogp/dx_i * dx_i/dz_i + dlog|J_i|/dz_i`.
    pub fn chain_gradient(&self, z: &[f64], grad_x: &[f64]) -> Vec<f64> {
        self.bijectors
            .iter()
            .zip(z.iter().zip(grad_x))
            .map(|(b, (&zi, &gi))| gi * b.forward_grad(zi) + b.log_jacobian_grad(zi))
            .collect()
    }
}
