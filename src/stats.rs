//! Online per-chain summary statistics and the potential scale reduction
//! factor.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Window length for the sliding acceptance-rate estimate.
const ACCEPT_WINDOW: usize = 100;

/// Streaming tracker for one chain: running mean, mean of squares and a
/// windowed acceptance-rate estimate based on state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTracker {
    n_params: usize,
    n: u64,
    p_accept: f64,
    mean: Array1<f64>,
    mean_sq: Array1<f64>,
    last_state: Vec<f64>,
    accept_queue: VecDeque<bool>,
}

/// Snapshot of a tracker, cheap to hand across chains.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStats {
    pub n: u64,
    pub p_accept: f64,
    pub mean: Array1<f64>,
    /// Sample variance per parameter.
    pub sm2: Array1<f64>,
}

impl ChainTracker {
    pub fn new(n_params: usize, initial_state: &[f64]) -> Self {
        Self {
            n_params,
            n: 0,
            p_accept: 0.0,
            mean: Array1::zeros(n_params),
            mean_sq: Array1::zeros(n_params),
            last_state: initial_state.to_vec(),
            accept_queue: VecDeque::with_capacity(ACCEPT_WINDOW + 1),
        }
    }

    pub fn step(&mut self, x: &[f64]) -> Result<()> {
        if x.len() != self.n_params {
            return Err(Error::Shape {
                expected: self.n_params,
                got: x.len(),
            });
        }
        self.n += 1;

        let accepted = self.last_state.iter().ne(x.iter());
        self.accept_queue.push_back(accepted);
        if self.accept_queue.len() > ACCEPT_WINDOW {
            self.accept_queue.pop_front();
        }
        let hits = self.accept_queue.iter().filter(|&&a| a).count();
        self.p_accept = hits as f64 / self.accept_queue.len() as f64;
        self.last_state.copy_from_slice(x);

        let n = self.n as f64;
        let x_arr = ArrayView1::from(x);
        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        if self.n == 1 {
            self.mean_sq = x_arr.mapv(|v| v * v);
        } else {
            self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.mapv(|v| v * v)) / n;
        }
        Ok(())
    }

    /// Sample variance per parameter; zero until two draws have been seen.
    pub fn sm2(&self) -> Array1<f64> {
        if self.n < 2 {
            return Array1::zeros(self.mean.len());
        }
        let n = self.n as f64;
        (&self.mean_sq - self.mean.mapv(|m| m * m)) * n / (n - 1.0)
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            n: self.n,
            p_accept: self.p_accept,
            mean: self.mean.clone(),
            sm2: self.sm2(),
        }
    }
}

/// Per-parameter potential scale reduction factor across chains (Gelman &
/// Rubin), from each chain's running mean and variance.
pub fn collect_rhat(all_chain_stats: &[&ChainStats]) -> Result<Array1<f64>> {
    if all_chain_stats.len() < 2 {
        return Err(Error::Stats(
            "R-hat needs at least two chains".into(),
        ));
    }
    let means: Vec<ArrayView1<f64>> =
        all_chain_stats.iter().map(|s| s.mean.view()).collect();
    let means = ndarray::stack(Axis(0), &means)
        .map_err(|e| Error::Stats(e.to_string()))?;
    let sm2s: Vec<ArrayView1<f64>> =
        all_chain_stats.iter().map(|s| s.sm2.view()).collect();
    let sm2s = ndarray::stack(Axis(0), &sm2s)
        .map_err(|e| Error::Stats(e.to_string()))?;

    let within = sm2s
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::Stats("within-chain variance reduction failed".into()))?;
    let global_means = means
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::Stats("global mean reduction failed".into()))?;
    let n_chains = all_chain_stats.len() as f64;
    let diffs = &means - &global_means.insert_axis(Axis(0));
    let n: f64 = all_chain_stats.iter().map(|s| s.n as f64).sum::<f64>() / n_chains;
    let between = diffs.mapv(|d| d * d).sum_axis(Axis(0)) * n / (n_chains - 1.0);

    let var = &within * ((n - 1.0) / n) + &between * (1.0 / n);
    Ok((var / within).mapv(f64::sqrt))
}

/// Largest per-parameter R-hat, for progress displays.
pub fn max_rhat(all_chain_stats: &[&ChainStats]) -> Result<f64> {
    let all = collect_rhat(all_chain_stats)?;
    let max = all
        .max()
        .map_err(|e| Error::Stats(e.to_string()))?;
    Ok(*max)
}
