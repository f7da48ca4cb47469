/*!
Trajectory builders: static HMC, dual-averaging HMC and NUTS.

All three variants share one contract, [`TrajectoryBuilder::propose`]: given
a Hamiltonian, a phase point with freshly drawn momentum, and a step size,
produce the next phase point plus the per-iteration statistics the
adaptation controller consumes. The static and dual-averaging variants run
a fixed-length leapfrog trajectory and apply a Metropolis correction; NUTS
grows a balanced binary tree by recursive doubling, samples among its
leaves with multinomial weights, and stops on a generalized U-turn or a
divergence.
*/

use rand::Rng;

use crate::distributions::GradientTarget;
use crate::error::Result;
use crate::hamiltonian::{Hamiltonian, PhasePoint};

/// Energy error beyond which a NUTS leaf counts as divergent.
pub const DEFAULT_MAX_ENERGY_ERROR: f64 = 1000.0;

/// Default NUTS doubling limit.
pub const DEFAULT_MAX_TREE_DEPTH: u32 = 10;

/// Per-iteration diagnostics produced alongside a proposal.
#[derive(Debug, Clone, Copy)]
pub struct ProposalStats {
    /// Acceptance statistic fed to dual averaging. For static variants the
    /// Metropolis probability; for NUTS the trajectory-averaged statistic.
    pub accept_prob: f64,
    pub divergent: bool,
    /// Tree depth reached; `None` for non-NUTS variants.
    pub depth: Option<u32>,
    /// Energy of the returned point minus the starting energy.
    pub energy_error: f64,
    pub n_leapfrog: usize,
}

/// Outcome of one `propose` call.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub point: PhasePoint,
    /// Whether `point` differs from the starting point.
    pub accepted: bool,
    pub stats: ProposalStats,
}

/// Proposal mechanism, one variant per algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrajectoryBuilder {
    /// Fixed number of leapfrog steps.
    Static { n_leapfrog: usize },
    /// Step count derived from a target total integration time.
    DualAveraging { int_time: f64 },
    /// Recursive doubling with multinomial sampling.
    Nuts { max_depth: u32, max_energy_error: f64 },
}

impl TrajectoryBuilder {
    /// Produce the next phase point from `current`, whose momentum must be
    /// freshly drawn.
    pub fn propose<T, R>(
        &self,
        ham: &Hamiltonian<'_, T>,
        current: &PhasePoint,
        step_size: f64,
        rng: &mut R,
    ) -> Result<Proposal>
    where
        T: GradientTarget + ?Sized,
        R: Rng,
    {
        match *self {
            TrajectoryBuilder::Static { n_leapfrog } => {
                metropolis_trajectory(ham, current, step_size, n_leapfrog, rng)
            }
            TrajectoryBuilder::DualAveraging { int_time } => {
                let n = ((int_time / step_size).round() as usize).max(1);
                metropolis_trajectory(ham, current, step_size, n, rng)
            }
            TrajectoryBuilder::Nuts {
                max_depth,
                max_energy_error,
            } => nuts_trajectory(ham, current, step_size, max_depth, max_energy_error, rng),
        }
    }
}

fn metropolis_trajectory<T, R>(
    ham: &Hamiltonian<'_, T>,
    current: &PhasePoint,
    step_size: f64,
    n_leapfrog: usize,
    rng: &mut R,
) -> Result<Proposal>
where
    T: GradientTarget + ?Sized,
    R: Rng,
{
    let h0 = ham.energy(current);
    let mut proposal = current.clone();
    let steps_taken = ham.integrate(&mut proposal, step_size, n_leapfrog)?;
    let h1 = ham.energy(&proposal);

    let divergent = !h1.is_finite();
    let accept_prob = if divergent {
        0.0
    } else {
        (h0 - h1).exp().min(1.0)
    };
    let accepted = !divergent && rng.random::<f64>() < accept_prob;
    let stats = ProposalStats {
        accept_prob,
        divergent,
        depth: None,
        energy_error: if divergent { f64::INFINITY } else { h1 - h0 },
        n_leapfrog: steps_taken,
    };
    Ok(Proposal {
        point: if accepted { proposal } else { current.clone() },
        accepted,
        stats,
    })
}

/// `log(exp(a) + exp(b))` without overflow.
fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// A contiguous segment of the trajectory, oriented in absolute time:
/// `minus` is the backward-most endpoint, `plus` the forward-most.
struct Subtree {
    minus: PhasePoint,
    plus: PhasePoint,
    sample: PhasePoint,
    log_weight: f64,
    turning: bool,
    divergent: bool,
}

struct NutsBuilder<'h, 'a, T: GradientTarget + ?Sized> {
    ham: &'h Hamiltonian<'a, T>,
    step_size: f64,
    h0: f64,
    max_energy_error: f64,
    n_leapfrog: usize,
    sum_accept: f64,
}

impl<'h, 'a, T: GradientTarget + ?Sized> NutsBuilder<'h, 'a, T> {
    /// Generalized U-turn test across a segment: stop when the displacement
    /// projected onto the metric-scaled momentum at either endpoint turns
    /// negative.
    fn is_turning(&self, minus: &PhasePoint, plus: &PhasePoint) -> bool {
        let n = minus.position.len();
        let delta: Vec<f64> = (0..n)
            .map(|i| plus.position[i] - minus.position[i])
            .collect();
        let v_minus = self.ham.metric().mul_inv_mass(&minus.momentum);
        let v_plus = self.ham.metric().mul_inv_mass(&plus.momentum);
        let fwd: f64 = delta.iter().zip(&v_plus).map(|(d, v)| d * v).sum();
        let bwd: f64 = delta.iter().zip(&v_minus).map(|(d, v)| d * v).sum();
        fwd < 0.0 || bwd < 0.0
    }

    /// One leapfrog from `from` in direction `dir`.
    fn build_leaf(&mut self, from: &PhasePoint, dir: f64) -> Result<Subtree> {
        let mut point = from.clone();
        self.ham.leapfrog(&mut point, dir * self.step_size)?;
        self.n_leapfrog += 1;

        let h = self.ham.energy(&point);
        let energy_error = h - self.h0;
        let divergent = !h.is_finite() || energy_error > self.max_energy_error;
        let log_weight = if divergent {
            f64::NEG_INFINITY
        } else {
            -energy_error
        };
        self.sum_accept += if h.is_finite() {
            (self.h0 - h).exp().min(1.0)
        } else {
            0.0
        };
        Ok(Subtree {
            minus: point.clone(),
            plus: point.clone(),
            sample: point,
            log_weight,
            turning: false,
            divergent,
        })
    }

    /// A balanced subtree of `2^depth` leaves grown from `from` in
    /// direction `dir`. An invalid inner subtree (turning or divergent)
    /// propagates up unmerged; its sample never enters the selection.
    fn build_tree<R: Rng>(
        &mut self,
        from: &PhasePoint,
        dir: f64,
        depth: u32,
        rng: &mut R,
    ) -> Result<Subtree> {
        if depth == 0 {
            return self.build_leaf(from, dir);
        }
        let mut first = self.build_tree(from, dir, depth - 1, rng)?;
        if first.turning || first.divergent {
            return Ok(first);
        }
        let grow_from = if dir > 0.0 { &first.plus } else { &first.minus };
        let second = self.build_tree(grow_from, dir, depth - 1, rng)?;
        if second.divergent {
            first.divergent = true;
            return Ok(first);
        }
        if second.turning {
            first.turning = true;
            return Ok(first);
        }

        let log_weight = log_add_exp(first.log_weight, second.log_weight);
        // Unbiased multinomial selection between the two halves.
        if (second.log_weight - log_weight).exp() > rng.random::<f64>() {
            first.sample = second.sample;
        }
        if dir > 0.0 {
            first.plus = second.plus;
        } else {
            first.minus = second.minus;
        }
        first.log_weight = log_weight;
        first.turning = self.is_turning(&first.minus, &first.plus);
        Ok(first)
    }
}

fn nuts_trajectory<T, R>(
    ham: &Hamiltonian<'_, T>,
    current: &PhasePoint,
    step_size: f64,
    max_depth: u32,
    max_energy_error: f64,
    rng: &mut R,
) -> Result<Proposal>
where
    T: GradientTarget + ?Sized,
    R: Rng,
{
    let h0 = ham.energy(current);
    let mut builder = NutsBuilder {
        ham,
        step_size,
        h0,
        max_energy_error,
        n_leapfrog: 0,
        sum_accept: 0.0,
    };

    let mut minus = current.clone();
    let mut plus = current.clone();
    let mut sample = current.clone();
    let mut sample_is_new = false;
    let mut log_weight = 0.0;
    let mut divergent = false;
    let mut depth = 0u32;

    // A non-finite starting energy means the fresh momentum already sits at
    // an invalid point; flag and reject immediately.
    if !h0.is_finite() {
        return Ok(Proposal {
            point: current.clone(),
            accepted: false,
            stats: ProposalStats {
                accept_prob: 0.0,
                divergent: true,
                depth: Some(0),
                energy_error: f64::INFINITY,
                n_leapfrog: 0,
            },
        });
    }

    while depth < max_depth {
        let dir = if rng.random::<bool>() { 1.0 } else { -1.0 };
        let from = if dir > 0.0 { &plus } else { &minus };
        let subtree = builder.build_tree(from, dir, depth, rng)?;

        if subtree.divergent {
            divergent = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Biased progressive sampling favors the fresh half of the
        // trajectory.
        if (subtree.log_weight - log_weight).exp() > rng.random::<f64>() {
            sample = subtree.sample.clone();
            sample_is_new = true;
        }
        log_weight = log_add_exp(log_weight, subtree.log_weight);
        if dir > 0.0 {
            plus = subtree.plus;
        } else {
            minus = subtree.minus;
        }
        depth += 1;
        if builder.is_turning(&minus, &plus) {
            break;
        }
    }

    let accept_prob = if builder.n_leapfrog > 0 {
        builder.sum_accept / builder.n_leapfrog as f64
    } else {
        0.0
    };
    let h_sample = ham.energy(&sample);
    let stats = ProposalStats {
        accept_prob,
        divergent,
        depth: Some(depth),
        energy_error: h_sample - h0,
        n_leapfrog: builder.n_leapfrog,
    };
    Ok(Proposal {
        point: sample,
        accepted: sample_is_new,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{DiagGaussian, GradientTarget};
    use crate::hamiltonian::Metric;
    use crate::state::ParameterSpace;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn gaussian_ham(
        dim: usize,
    ) -> (DiagGaussian, ParameterSpace, Metric) {
        let target = DiagGaussian::standard(dim);
        let space = ParameterSpace::for_target(&target).unwrap();
        (target, space, Metric::unit(dim))
    }

    #[test]
    fn static_trajectory_accepts_small_steps() {
        let (target, space, metric) = gaussian_ham(2);
        let ham = Hamiltonian::new(&target, &space, &metric).unwrap();
        let builder = TrajectoryBuilder::Static { n_leapfrog: 10 };
        let mut rng = SmallRng::seed_from_u64(3);
        let mut accepts = 0;
        for _ in 0..200 {
            let momentum = ham.sample_momentum(&mut rng);
            let point = ham.phase_point(vec![0.5, -0.5], momentum).unwrap();
            let prop = builder.propose(&ham, &point, 0.05, &mut rng).unwrap();
            assert_eq!(prop.stats.n_leapfrog, 10);
            assert!(!prop.stats.divergent);
            if prop.accepted {
                accepts += 1;
            }
        }
        // Acceptance should be near 1 at this step size.
        assert!(accepts > 190, "only {accepts}/200 accepted");
    }

    #[test]
    fn dual_averaging_step_count_tracks_integration_time() {
        let (target, space, metric) = gaussian_ham(1);
        let ham = Hamiltonian::new(&target, &space, &metric).unwrap();
        let builder = TrajectoryBuilder::DualAveraging { int_time: 1.0 };
        let mut rng = SmallRng::seed_from_u64(9);
        let momentum = ham.sample_momentum(&mut rng);
        let point = ham.phase_point(vec![0.0], momentum).unwrap();
        let prop = builder.propose(&ham, &point, 0.3, &mut rng).unwrap();
        assert_eq!(prop.stats.n_leapfrog, 3);
        // Even a huge step size runs at least one leapfrog.
        let prop = builder.propose(&ham, &point, 50.0, &mut rng).unwrap();
        assert_eq!(prop.stats.n_leapfrog, 1);
    }

    #[test]
    fn nuts_stays_finite_and_bounded() {
        let (target, space, metric) = gaussian_ham(2);
        let ham = Hamiltonian::new(&target, &space, &metric).unwrap();
        let builder = TrajectoryBuilder::Nuts {
            max_depth: 6,
            max_energy_error: DEFAULT_MAX_ENERGY_ERROR,
        };
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..50 {
            let momentum = ham.sample_momentum(&mut rng);
            let point = ham.phase_point(vec![1.0, -1.0], momentum).unwrap();
            let prop = builder.propose(&ham, &point, 0.2, &mut rng).unwrap();
            let depth = prop.stats.depth.unwrap();
            assert!(depth <= 6);
            assert!(prop.stats.n_leapfrog <= (1 << 7));
            assert!(prop.point.position.iter().all(|x| x.is_finite()));
            assert!(prop.stats.accept_prob >= 0.0 && prop.stats.accept_prob <= 1.0);
        }
    }

    #[test]
    fn non_finite_gradient_flags_divergence() {
        struct Cliff;
        impl GradientTarget for Cliff {
            fn dim(&self) -> usize {
                1
            }
            fn logp_and_grad(&self, p: &[f64]) -> crate::error::Result<(f64, Vec<f64>)> {
                let x = p[0];
                if x > 1.0 {
                    return Ok((f64::NAN, vec![f64::NAN]));
                }
                Ok((-0.5 * x * x, vec![-x]))
            }
        }
        let space = ParameterSpace::for_target(&Cliff).unwrap();
        let metric = Metric::unit(1);
        let ham = Hamiltonian::new(&Cliff, &space, &metric).unwrap();
        let builder = TrajectoryBuilder::Static { n_leapfrog: 5 };
        let mut rng = SmallRng::seed_from_u64(1);
        // Aim straight at the cliff with a large step.
        let point = ham.phase_point(vec![0.9], vec![3.0]).unwrap();
        let prop = builder.propose(&ham, &point, 1.0, &mut rng).unwrap();
        assert!(prop.stats.divergent);
        assert!(!prop.accepted);
        assert_eq!(prop.point.position, vec![0.9]);
        assert!(prop.point.position[0].is_finite());
        // The first step already lands past the cliff; the remaining four
        // never run.
        assert_eq!(prop.stats.n_leapfrog, 1);
    }

    #[test]
    fn log_add_exp_is_stable() {
        assert_eq!(log_add_exp(f64::NEG_INFINITY, 0.0), 0.0);
        assert_eq!(log_add_exp(0.0, f64::NEG_INFINITY), 0.0);
        let v = log_add_exp(1000.0, 1000.0);
        assert!((v - (1000.0 + 2f64.ln())).abs() < 1e-12);
    }
}
