//! Adaptive gradient-based MCMC: static HMC, dual-averaging HMC and NUTS,
//! with Stan-style windowed warmup adaptation of step size and mass matrix.

pub mod adapt;
pub mod distributions;
pub mod error;
pub mod hamiltonian;
pub mod sampler;
pub mod state;
pub mod stats;
pub mod trajectory;
pub mod transforms;

pub use error::{Error, Result};
pub use sampler::{HmcChain, Sampler, SamplerConfig, Transition, TransitionStats};
pub use trajectory::TrajectoryBuilder;
