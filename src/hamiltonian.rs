/*!
Kinetic-energy metric, phase-space points and the leapfrog integrator.

[`Metric`] stores the *inverse* mass matrix, since that is what leapfrog
needs for the velocity `dq/dt = M^{-1} p` and the kinetic energy
`K = 0.5 p^T M^{-1} p`. The dense case keeps the lower Cholesky factor `L`
of the inverse mass, so `M^{-1} p` is two triangular multiplies and
momentum `p ~ N(0, M)` is one triangular solve `L^T p = z`.

[`Hamiltonian`] wraps a target (through its [`ParameterSpace`]) and a
metric into the potential/kinetic pair the trajectory builders integrate
against. It also supports restricting the dynamics to an active subset of
parameters for block-style partial updates. The wrapped oracle may be
expensive; every method here calls it at most once per position update.
*/

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::distributions::GradientTarget;
use crate::error::{Error, Result};
use crate::state::ParameterSpace;

/// Inverse mass matrix defining the kinetic-energy quadratic form.
#[derive(Debug, Clone)]
pub enum Metric {
    /// Diagonal inverse mass.
    Diag(Vec<f64>),
    /// Dense inverse mass stored as its lower Cholesky factor `L`
    /// (row-major), such that `inv_mass = L L^T`.
    Dense { dim: usize, l: Vec<f64> },
}

impl Metric {
    /// Unit metric (identity inverse mass).
    pub fn unit(dim: usize) -> Self {
        Metric::Diag(vec![1.0; dim])
    }

    pub fn dim(&self) -> usize {
        match self {
            Metric::Diag(v) => v.len(),
            Metric::Dense { dim, .. } => *dim,
        }
    }

    #[inline]
    fn l_at(l: &[f64], dim: usize, i: usize, j: usize) -> f64 {
        l[i * dim + j]
    }

    /// `v = M^{-1} p`.
    pub fn mul_inv_mass(&self, p: &[f64]) -> Vec<f64> {
        match self {
            Metric::Diag(inv_mass) => {
                inv_mass.iter().zip(p).map(|(&m, &pi)| m * pi).collect()
            }
            Metric::Dense { dim, l } => {
                let n = *dim;
                debug_assert_eq!(p.len(), n);
                // t = L^T p
                let mut t = vec![0.0; n];
                for i in 0..n {
                    let mut acc = 0.0;
                    for j in i..n {
                        acc += Self::l_at(l, n, j, i) * p[j];
                    }
                    t[i] = acc;
                }
                // v = L t
                let mut v = vec![0.0; n];
                for i in 0..n {
                    let mut acc = 0.0;
                    for j in 0..=i {
                        acc += Self::l_at(l, n, i, j) * t[j];
                    }
                    v[i] = acc;
                }
                v
            }
        }
    }

    /// `0.5 p^T M^{-1} p`.
    pub fn kinetic_energy(&self, p: &[f64]) -> f64 {
        let v = self.mul_inv_mass(p);
        0.5 * p.iter().zip(&v).map(|(&pi, &vi)| pi * vi).sum::<f64>()
    }

    /// Draw `p ~ N(0, M)`.
    pub fn sample_momentum<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        match self {
            Metric::Diag(inv_mass) => inv_mass
                .iter()
                .map(|&m| {
                    let sigma = if m > 0.0 { (1.0 / m).sqrt() } else { 1.0 };
                    let z: f64 = StandardNormal.sample(rng);
                    sigma * z
                })
                .collect(),
            Metric::Dense { dim, l } => {
                let n = *dim;
                let z: Vec<f64> =
                    (0..n).map(|_| StandardNormal.sample(rng)).collect();
                // Back-substitute L^T p = z.
                let mut p = vec![0.0; n];
                for i in (0..n).rev() {
                    let mut acc = z[i];
                    for j in (i + 1)..n {
                        acc -= Self::l_at(l, n, j, i) * p[j];
                    }
                    let d = Self::l_at(l, n, i, i);
                    p[i] = if d != 0.0 { acc / d } else { z[i] };
                }
                p
            }
        }
    }

    /// Restrict to a subset of dimensions, for partial updates.
    pub fn restrict(&self, active: &[usize]) -> Result<Metric> {
        match self {
            Metric::Diag(inv_mass) => {
                let mut sub = Vec::with_capacity(active.len());
                for &i in active {
                    let m = inv_mass.get(i).ok_or(Error::Shape {
                        expected: inv_mass.len(),
                        got: i + 1,
                    })?;
                    sub.push(*m);
                }
                Ok(Metric::Diag(sub))
            }
            Metric::Dense { .. } => Err(Error::Config(
                "dense metric does not support partial updates".into(),
            )),
        }
    }
}

/// A position/momentum pair with the cached potential energy and its
/// gradient at the position.
#[derive(Debug, Clone)]
pub struct PhasePoint {
    pub position: Vec<f64>,
    pub momentum: Vec<f64>,
    pub potential: f64,
    pub grad_potential: Vec<f64>,
}

/// Potential plus kinetic energy over an (optionally restricted) parameter
/// vector.
///
/// The wrapped target must be deterministic for a given position within one
/// call; when chains run in parallel it must either be `Sync` or
/// instantiated per chain.
pub struct Hamiltonian<'a, T: GradientTarget + ?Sized> {
    target: &'a T,
    space: &'a ParameterSpace,
    metric: &'a Metric,
    /// Full unconstrained vector; inactive entries stay fixed during a
    /// partial update.
    base: Vec<f64>,
    active: Vec<usize>,
    full: bool,
}

impl<'a, T: GradientTarget + ?Sized> Hamiltonian<'a, T> {
    /// Dynamics over the whole parameter vector.
    pub fn new(
        target: &'a T,
        space: &'a ParameterSpace,
        metric: &'a Metric,
    ) -> Result<Self> {
        let dim = space.dim();
        if metric.dim() != dim {
            return Err(Error::Shape {
                expected: dim,
                got: metric.dim(),
            });
        }
        Ok(Self {
            target,
            space,
            metric,
            base: vec![0.0; dim],
            active: (0..dim).collect(),
            full: true,
        })
    }

    /// Dynamics over the `active` coordinates only; the rest of `base` is
    /// held fixed. `metric` must already be restricted to the active
    /// dimensions.
    pub fn new_partial(
        target: &'a T,
        space: &'a ParameterSpace,
        metric: &'a Metric,
        base: Vec<f64>,
        active: Vec<usize>,
    ) -> Result<Self> {
        let dim = space.dim();
        if base.len() != dim {
            return Err(Error::Shape {
                expected: dim,
                got: base.len(),
            });
        }
        if metric.dim() != active.len() {
            return Err(Error::Shape {
                expected: active.len(),
                got: metric.dim(),
            });
        }
        if let Some(&bad) = active.iter().find(|&&i| i >= dim) {
            return Err(Error::Shape {
                expected: dim,
                got: bad + 1,
            });
        }
        let full = active.len() == dim;
        Ok(Self {
            target,
            space,
            metric,
            base,
            active,
            full,
        })
    }

    /// Dimension of the vectors this Hamiltonian integrates.
    pub fn dim(&self) -> usize {
        self.active.len()
    }

    pub fn metric(&self) -> &Metric {
        self.metric
    }

    /// Negative corrected log-density and its gradient at `position`
    /// (active coordinates). A non-finite density comes back as `+inf`
    /// potential with a zero gradient so callers can flag a divergence; an
    /// oracle error stays fatal.
    pub fn potential_and_gradient(&self, position: &[f64]) -> Result<(f64, Vec<f64>)> {
        if self.full {
            let (logp, grad) =
                self.space.logp_and_grad_unconstrained(self.target, position)?;
            if !logp.is_finite() {
                return Ok((f64::INFINITY, vec![0.0; position.len()]));
            }
            return Ok((-logp, grad.iter().map(|g| -g).collect()));
        }
        let mut z = self.base.clone();
        for (k, &i) in self.active.iter().enumerate() {
            z[i] = position[k];
        }
        let (logp, grad) = self.space.logp_and_grad_unconstrained(self.target, &z)?;
        if !logp.is_finite() {
            return Ok((f64::INFINITY, vec![0.0; position.len()]));
        }
        let sub_grad = self.active.iter().map(|&i| -grad[i]).collect();
        Ok((-logp, sub_grad))
    }

    pub fn kinetic_energy(&self, momentum: &[f64]) -> f64 {
        self.metric.kinetic_energy(momentum)
    }

    pub fn sample_momentum<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        self.metric.sample_momentum(rng)
    }

    /// Total energy `H = U(q) + K(p)`.
    pub fn energy(&self, point: &PhasePoint) -> f64 {
        point.potential + self.kinetic_energy(&point.momentum)
    }

    /// Build a phase point at `position` with the given momentum,
    /// evaluating the potential once.
    pub fn phase_point(&self, position: Vec<f64>, momentum: Vec<f64>) -> Result<PhasePoint> {
        let (potential, grad_potential) = self.potential_and_gradient(&position)?;
        Ok(PhasePoint {
            position,
            momentum,
            potential,
            grad_potential,
        })
    }

    /// One leapfrog step: half-kick, drift, half-kick. Deterministic and
    /// reversible under momentum negation; no caching shortcut may break
    /// that symmetry.
    pub fn leapfrog(&self, state: &mut PhasePoint, eps: f64) -> Result<()> {
        let n = state.position.len();
        for i in 0..n {
            state.momentum[i] -= 0.5 * eps * state.grad_potential[i];
        }
        let v = self.metric.mul_inv_mass(&state.momentum);
        for i in 0..n {
            state.position[i] += eps * v[i];
        }
        let (potential, grad) = self.potential_and_gradient(&state.position)?;
        state.potential = potential;
        state.grad_potential = grad;
        for i in 0..n {
            state.momentum[i] -= 0.5 * eps * state.grad_potential[i];
        }
        Ok(())
    }

    /// `n_steps` leapfrog steps in place. Returns the number of steps
    /// actually taken, which is smaller than `n_steps` when the trajectory
    /// hits a non-finite potential.
    pub fn integrate(&self, state: &mut PhasePoint, eps: f64, n_steps: usize) -> Result<usize> {
        for k in 0..n_steps {
            self.leapfrog(state, eps)?;
            if !state.potential.is_finite() {
                // Gradient is zeroed at divergent points; further steps
                // cannot recover.
                return Ok(k + 1);
            }
        }
        Ok(n_steps)
    }

    /// Scatter active-coordinate `position` back into a full vector.
    pub fn expand_position(&self, position: &[f64]) -> Vec<f64> {
        if self.full {
            return position.to_vec();
        }
        let mut z = self.base.clone();
        for (k, &i) in self.active.iter().enumerate() {
            z[i] = position[k];
        }
        z
    }
}
