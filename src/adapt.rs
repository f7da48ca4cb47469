/*!
Warmup adaptation: step size via dual averaging, mass matrix via Welford
estimators, both driven by a windowed schedule.

The schedule partitions the adaptation horizon into an initial buffer
(step size only, metric held at identity), doubling slow windows (metric
re-estimated and committed at each window end, dual averaging restarted
since the kinetic-energy geometry changed), and a terminal buffer (step
size only). After the horizon the whole state freezes and the step size
settles at its smoothed average.
*/

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::distributions::GradientTarget;
use crate::hamiltonian::{Hamiltonian, Metric};

/// Dual averaging for step-size adaptation (Nesterov 2009, Stan variant).
#[derive(Debug, Clone)]
pub struct DualAveraging {
    target_accept: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    step: usize,
}

impl DualAveraging {
    pub fn new(target_accept: f64, init_eps: f64) -> Self {
        // Initialize the smoothed estimate at the current step size; a
        // fixed starting point distorts short warmup runs.
        let log_eps0 = init_eps.ln();
        Self {
            target_accept,
            log_eps: log_eps0,
            log_eps_bar: log_eps0,
            h_bar: 0.0,
            mu: (10.0 * init_eps).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            step: 0,
        }
    }

    /// Incorporate the acceptance statistic of one transition.
    pub fn update(&mut self, accept_prob: f64) {
        self.step += 1;
        let m = self.step as f64;
        let w = 1.0 / (m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_prob);

        self.log_eps = self.mu - (m.sqrt() / self.gamma) * self.h_bar;
        let m_kappa = m.powf(-self.kappa);
        self.log_eps_bar = m_kappa * self.log_eps + (1.0 - m_kappa) * self.log_eps_bar;
    }

    /// Instantaneous step size, used while still adapting.
    pub fn current_step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed step size, used once adaptation ends.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    /// Restart for a new window, keeping the given step size.
    pub fn reset(&mut self, init_eps: f64) {
        self.log_eps = init_eps.ln();
        self.log_eps_bar = init_eps.ln();
        self.h_bar = 0.0;
        self.mu = (10.0 * init_eps).ln();
        self.step = 0;
    }
}

/// Online Welford variance estimator, for the diagonal metric.
#[derive(Debug, Clone)]
pub struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..x.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = x[i] - self.mean[i];
            self.m2[i] += delta * delta2;
        }
    }

    /// Sample variance per dimension; unit variance until two samples have
    /// been seen.
    pub fn variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![1.0; self.mean.len()];
        }
        let n = self.count as f64;
        self.m2
            .iter()
            .map(|&m| (m / (n - 1.0)).max(1e-10))
            .collect()
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Online Welford covariance estimator, for the dense metric.
#[derive(Debug, Clone)]
pub struct WelfordCovariance {
    mean: Vec<f64>,
    m2: Vec<f64>, // row-major dim x dim
    dim: usize,
    count: usize,
}

impl WelfordCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim * dim],
            dim,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        let dim = self.dim;

        let mut delta = vec![0.0; dim];
        for i in 0..dim {
            delta[i] = x[i] - self.mean[i];
            self.mean[i] += delta[i] / n;
        }
        for i in 0..dim {
            let d2i = x[i] - self.mean[i];
            for j in 0..dim {
                self.m2[j * dim + i] += delta[j] * d2i;
            }
        }
    }

    pub fn covariance(&self) -> Option<DMatrix<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count as f64) - 1.0;
        let mut cov = DMatrix::<f64>::zeros(self.dim, self.dim);
        for i in 0..self.dim {
            for j in 0..self.dim {
                cov[(i, j)] = self.m2[i * self.dim + j] / denom;
            }
        }
        Some(cov)
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Partition of an adaptation horizon into buffers and doubling slow
/// windows, Stan-style.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    init_buffer: usize,
    term_buffer: usize,
    horizon: usize,
    /// End iterations (exclusive) of the slow windows, strictly
    /// increasing; the last equals `horizon - term_buffer`.
    window_ends: Vec<usize>,
}

impl WarmupSchedule {
    /// Build the partition; fails when the horizon cannot hold both
    /// buffers.
    pub fn new(
        horizon: usize,
        init_buffer: usize,
        term_buffer: usize,
        base_window: usize,
    ) -> Result<Self> {
        if horizon > 0 && horizon < init_buffer + term_buffer {
            return Err(Error::Config(format!(
                "adaptation horizon {horizon} too small for initial buffer \
                 {init_buffer} plus terminal buffer {term_buffer}"
            )));
        }
        if base_window == 0 {
            return Err(Error::Config("base window must be positive".into()));
        }
        let slow_end = horizon - term_buffer.min(horizon);
        let mut window_ends = Vec::new();
        let mut start = init_buffer.min(slow_end);
        let mut size = base_window;
        while start < slow_end {
            let mut end = (start + size).min(slow_end);
            // Absorb the remainder when the next doubled window would not
            // fit.
            if slow_end - end < 2 * size {
                end = slow_end;
            }
            window_ends.push(end);
            start = end;
            size *= 2;
        }
        Ok(Self {
            init_buffer,
            term_buffer,
            horizon,
            window_ends,
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn window_ends(&self) -> &[usize] {
        &self.window_ends
    }

    /// Whether iteration `iter` falls in a slow (metric-estimating)
    /// window.
    pub fn in_slow_window(&self, iter: usize) -> bool {
        iter >= self.init_buffer && iter < self.horizon - self.term_buffer.min(self.horizon)
    }
}

/// Which metric structure adaptation should estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Identity inverse mass, never re-estimated.
    Unit,
    /// Per-dimension variances.
    Diag,
    /// Full covariance with shrinkage.
    Dense,
}

/// Per-chain adaptation state: dual averaging, metric estimators and the
/// window schedule. Created once per chain, mutated once per iteration
/// while adapting, frozen at the horizon.
pub struct AdaptationState {
    dual_avg: DualAveraging,
    welford: WelfordVariance,
    welford_cov: Option<WelfordCovariance>,
    schedule: WarmupSchedule,
    window_idx: usize,
    metric: Metric,
    kind: MetricKind,
    frozen: bool,
}

impl AdaptationState {
    pub fn new(
        dim: usize,
        schedule: WarmupSchedule,
        kind: MetricKind,
        target_accept: f64,
        init_eps: f64,
    ) -> Self {
        let welford_cov = match kind {
            MetricKind::Dense => Some(WelfordCovariance::new(dim)),
            _ => None,
        };
        let frozen = schedule.horizon == 0;
        Self {
            dual_avg: DualAveraging::new(target_accept, init_eps),
            welford: WelfordVariance::new(dim),
            welford_cov,
            schedule,
            window_idx: 0,
            metric: Metric::unit(dim),
            kind,
            frozen,
        }
    }

    /// Incorporate iteration `iter`'s position and acceptance statistic.
    /// Returns `true` when the metric was re-committed, so the caller can
    /// rebuild anything that borrowed it.
    pub fn update(&mut self, iter: usize, position: &[f64], accept_prob: f64) -> bool {
        if self.frozen {
            return false;
        }
        self.dual_avg.update(accept_prob);

        let mut committed = false;
        if self.kind != MetricKind::Unit && self.schedule.in_slow_window(iter) {
            self.welford.update(position);
            if let Some(wc) = self.welford_cov.as_mut() {
                wc.update(position);
            }
            if self.window_idx < self.schedule.window_ends.len()
                && iter + 1 >= self.schedule.window_ends[self.window_idx]
            {
                self.commit_metric();
                committed = true;
                self.window_idx += 1;
                // The geometry changed underneath dual averaging; restart
                // it from the smoothed step size.
                let eps = self.dual_avg.adapted_step_size();
                self.dual_avg.reset(eps);
            }
        }

        if iter + 1 >= self.schedule.horizon {
            self.frozen = true;
        }
        committed
    }

    fn commit_metric(&mut self) {
        let var = self.welford.variance();
        self.metric = Metric::Diag(var.clone());
        if let Some(wc) = &self.welford_cov {
            if let Some(mut cov) = wc.covariance() {
                let n = cov.nrows();
                let count = wc.count().max(1) as f64;
                // Shrink toward a scaled identity for stability before
                // factoring.
                let alpha = count / (count + 5.0);
                let trace = cov.trace();
                let scale = (trace / n as f64).abs().max(1e-6);
                cov *= alpha;
                for i in 0..n {
                    cov[(i, i)] += (1.0 - alpha) * scale + 1e-6 * scale;
                }
                if let Some(ch) = cov.cholesky() {
                    let l = ch.l();
                    let mut flat = vec![0.0; n * n];
                    for i in 0..n {
                        for j in 0..=i {
                            flat[i * n + j] = l[(i, j)];
                        }
                    }
                    self.metric = Metric::Dense { dim: n, l: flat };
                }
            }
        }
        self.welford.reset();
        if let Some(wc) = self.welford_cov.as_mut() {
            wc.reset();
        }
    }

    /// Step size to integrate with at the current iteration.
    pub fn step_size(&self) -> f64 {
        if self.frozen {
            self.dual_avg.adapted_step_size()
        } else {
            self.dual_avg.current_step_size()
        }
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// Find a reasonable initial step size (Hoffman & Gelman 2014, Algorithm
/// 4): from 0.1, double or halve until the single-leapfrog acceptance
/// probability crosses 0.5.
pub fn find_reasonable_step_size<T: GradientTarget + ?Sized>(
    ham: &Hamiltonian<'_, T>,
    position: &[f64],
) -> Result<f64> {
    let momentum = vec![1.0; position.len()];
    let state = ham.phase_point(position.to_vec(), momentum)?;
    if !state.potential.is_finite() {
        return Err(Error::Config(
            "initial position has non-finite log-density".into(),
        ));
    }
    let h0 = ham.energy(&state);

    let test_accept = |eps: f64| -> Result<f64> {
        let mut s = state.clone();
        ham.leapfrog(&mut s, eps)?;
        let h1 = ham.energy(&s);
        let a = (h0 - h1).exp();
        Ok(if a.is_finite() { a.min(1.0) } else { 0.0 })
    };

    let mut eps = 0.1;
    let mut accept = test_accept(eps)?;
    if accept == 0.0 {
        eps = 1e-3;
        accept = test_accept(eps)?;
        if accept == 0.0 {
            return Ok(eps);
        }
    }

    let direction: f64 = if accept > 0.5 { 1.0 } else { -1.0 };
    for _ in 0..50 {
        let new_eps = eps * 2f64.powf(direction);
        if !(1e-10..=1e3).contains(&new_eps) {
            break;
        }
        let a = test_accept(new_eps)?;
        if (direction > 0.0 && a < 0.5) || (direction < 0.0 && a > 0.5) {
            break;
        }
        eps = new_eps;
    }
    Ok(eps.clamp(1e-8, 1e3))
}
