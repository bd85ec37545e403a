use crate::common::*;
use indicatif::{ProgressBar, ProgressDrawTarget};

/// A function to minimise
pub trait Objective {
    /// `(value, gradient)` at `theta`
    fn evaluate(&mut self, theta: &[f64]) -> anyhow::Result<(f64, Vec<f64>)>;
}

pub trait Optimizer {
    /// Minimise `objective` from `start`; returns the best point seen
    fn optimize(&mut self, objective: &mut dyn Objective, start: Vec<f64>)
        -> anyhow::Result<Vec<f64>>;
}

#[derive(Debug, Clone)]
pub struct AdamOptions {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub max_iter: usize,
    /// stop once the gradient norm falls below this
    pub grad_tol: f64,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            max_iter: 500,
            grad_tol: 1e-6,
            verbose: false,
            show_progress: true,
        }
    }
}

/// First-order optimizer with bias-corrected moment estimates
pub struct Adam {
    options: AdamOptions,
    trace: Vec<f64>,
}

impl Adam {
    pub fn new(options: AdamOptions) -> Self {
        Self {
            options,
            trace: vec![],
        }
    }

    /// Objective value at every iteration of the last run
    pub fn trace(&self) -> &[f64] {
        &self.trace
    }
}

impl Optimizer for Adam {
    fn optimize(
        &mut self,
        objective: &mut dyn Objective,
        start: Vec<f64>,
    ) -> anyhow::Result<Vec<f64>> {
        let opts = &self.options;
        let dim = start.len();
        let mut theta = start;
        let mut m = vec![0.0; dim];
        let mut v = vec![0.0; dim];

        let mut best = (f64::INFINITY, theta.clone());
        self.trace.clear();

        let pb = ProgressBar::new(opts.max_iter as u64);
        if !opts.show_progress || opts.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for iter in 0..opts.max_iter {
            let (value, grad) = objective.evaluate(&theta)?;
            if grad.len() != dim {
                return Err(LentilError::DimensionMismatch {
                    what: "objective gradient",
                    expected: dim,
                    actual: grad.len(),
                }
                .into());
            }
            if !value.is_finite() {
                return Err(LentilError::Numerical(format!(
                    "objective is {} at iteration {}",
                    value,
                    iter + 1
                ))
                .into());
            }

            self.trace.push(value);
            if value < best.0 {
                best = (value, theta.clone());
            }

            let grad_norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
            pb.inc(1);
            if opts.verbose {
                info!("[{}] objective: {}, |grad|: {}", iter + 1, value, grad_norm);
            }
            if grad_norm < opts.grad_tol {
                info!("converged at iteration {}", iter + 1);
                break;
            }

            let t = (iter + 1) as i32;
            let bias1 = 1.0 - opts.beta1.powi(t);
            let bias2 = 1.0 - opts.beta2.powi(t);
            for j in 0..dim {
                m[j] = opts.beta1 * m[j] + (1.0 - opts.beta1) * grad[j];
                v[j] = opts.beta2 * v[j] + (1.0 - opts.beta2) * grad[j] * grad[j];
                let m_hat = m[j] / bias1;
                let v_hat = v[j] / bias2;
                theta[j] -= opts.learning_rate * m_hat / (v_hat.sqrt() + opts.epsilon);
            }
        }
        pb.finish_and_clear();

        info!(
            "best objective {} after {} evaluations",
            best.0,
            self.trace.len()
        );
        Ok(best.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        centre: Vec<f64>,
    }

    impl Objective for Quadratic {
        fn evaluate(&mut self, theta: &[f64]) -> anyhow::Result<(f64, Vec<f64>)> {
            let grad: Vec<f64> = theta
                .iter()
                .zip(self.centre.iter())
                .map(|(t, c)| t - c)
                .collect();
            let value = 0.5 * grad.iter().map(|g| g * g).sum::<f64>();
            Ok((value, grad))
        }
    }

    #[test]
    fn adam_finds_the_minimum_of_a_quadratic() {
        let mut adam = Adam::new(AdamOptions {
            learning_rate: 0.1,
            max_iter: 2000,
            show_progress: false,
            ..AdamOptions::default()
        });
        let mut objective = Quadratic {
            centre: vec![1.0, -2.0, 0.5],
        };
        let theta = adam.optimize(&mut objective, vec![0.0; 3]).unwrap();
        for (t, c) in theta.iter().zip([1.0, -2.0, 0.5]) {
            assert!((t - c).abs() < 1e-2);
        }
        assert!(adam.trace().first().unwrap() > adam.trace().last().unwrap());
    }
}
