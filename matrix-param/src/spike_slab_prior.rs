use crate::error::{check_length, ParamError};
use crate::spike_slab_posterior::{SpikeSlabPosterior, BINARY_PROB_EPS};
use crate::traits::*;
use nalgebra::{DMatrix, DVector};

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

/// Spike-and-slab prior over an `N x Q` latent matrix:
///
/// ```text
/// p(x[n,q]) = pi[q] * N(0, slab_variance) + (1 - pi[q]) * delta_0
/// ```
///
/// Under grouping the spike is shared by every dimension of a row and
/// its prior inclusion probability is the average of `pi`.
#[derive(Debug, Clone)]
pub struct SpikeSlabPrior {
    pi: DVec,
    slab_variance: f64,
    group_spike: bool,
    learn_pi: bool,
    pi_grad: DVec,
}

impl SpikeSlabPrior {
    /// * `pi` - prior inclusion probability per latent dimension, each
    ///   in the open interval (0, 1)
    pub fn new(pi: DVec) -> anyhow::Result<Self> {
        if let Some(p) = pi.iter().find(|&&p| !(p > 0.0 && p < 1.0)) {
            return Err(ParamError::InvalidValue {
                what: "pi",
                message: format!("{} is outside (0, 1)", p),
            }
            .into());
        }
        let dim = pi.len();
        Ok(Self {
            pi,
            slab_variance: 1.0,
            group_spike: false,
            learn_pi: false,
            pi_grad: DVec::zeros(dim),
        })
    }

    /// `pi = 0.5` for every dimension
    pub fn uniform(dim: usize) -> Self {
        Self {
            pi: DVec::from_element(dim, 0.5),
            slab_variance: 1.0,
            group_spike: false,
            learn_pi: false,
            pi_grad: DVec::zeros(dim),
        }
    }

    pub fn with_slab_variance(mut self, slab_variance: f64) -> anyhow::Result<Self> {
        if !(slab_variance > 0.0 && slab_variance.is_finite()) {
            return Err(ParamError::InvalidValue {
                what: "slab_variance",
                message: format!("must be positive, found {}", slab_variance),
            }
            .into());
        }
        self.slab_variance = slab_variance;
        Ok(self)
    }

    pub fn set_group_spike(&mut self, group_spike: bool) {
        self.group_spike = group_spike;
    }

    pub fn set_learn_pi(&mut self, learn_pi: bool) {
        self.learn_pi = learn_pi;
    }

    pub fn pi(&self) -> &DVec {
        &self.pi
    }

    pub fn slab_variance(&self) -> f64 {
        self.slab_variance
    }

    pub fn group_spike(&self) -> bool {
        self.group_spike
    }

    pub fn learn_pi(&self) -> bool {
        self.learn_pi
    }

    pub fn dim(&self) -> usize {
        self.pi.len()
    }

    fn check_posterior(&self, q: &SpikeSlabPosterior) -> anyhow::Result<()> {
        check_length("pi vs. latent dimensions", q.ncols(), self.pi.len())?;
        if q.group_spike() != self.group_spike {
            return Err(ParamError::InvalidValue {
                what: "group_spike",
                message: "prior and posterior disagree on grouping".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn group_pi(&self) -> f64 {
        self.pi.mean()
    }

    /// Slab part of the divergence per entry, before weighting by gamma:
    /// `KL(N(mu, S) || N(0, v))`
    fn slab_kl(&self, mu: f64, s: f64) -> f64 {
        let v = self.slab_variance;
        0.5 * (v.ln() - 1.0 + (mu * mu + s) / v - s.ln())
    }

    fn bernoulli_kl(gamma: f64, pi: f64) -> f64 {
        gamma * (gamma / pi).ln() + (1.0 - gamma) * ((1.0 - gamma) / (1.0 - pi)).ln()
    }

    /// `KL(q(X) || p(X))` summed over all entries
    pub fn kl_divergence(&self, q: &SpikeSlabPosterior) -> anyhow::Result<f64> {
        self.check_posterior(q)?;

        let (mu, s, gamma) = (q.mean(), q.variance(), q.binary_prob());
        let (nn, kk) = q.shape();

        let mut kl_slab = 0.0;
        for k in 0..kk {
            for i in 0..nn {
                kl_slab += gamma[(i, k)] * self.slab_kl(mu[(i, k)], s[(i, k)]);
            }
        }

        let kl_spike: f64 = if self.group_spike {
            let pi = self.group_pi();
            if kk == 0 {
                0.0
            } else {
                (0..nn)
                    .map(|i| Self::bernoulli_kl(gamma[(i, 0)], pi))
                    .sum()
            }
        } else {
            let mut acc = 0.0;
            for k in 0..kk {
                let pi = self.pi[k];
                for i in 0..nn {
                    acc += Self::bernoulli_kl(gamma[(i, k)], pi);
                }
            }
            acc
        };

        Ok(kl_slab + kl_spike)
    }

    /// Add the gradient of `-KL` to the posterior's gradient slots.
    ///
    /// The slots already carry the evidence gradient; this call only
    /// accumulates. Under grouping the per-row gradient of the shared
    /// inclusion probability (slab terms summed over dimensions plus
    /// one Bernoulli term) is added to every column of that row.
    pub fn update_gradients_kl(&self, q: &mut SpikeSlabPosterior) -> anyhow::Result<()> {
        self.check_posterior(q)?;

        let v = self.slab_variance;
        let (nn, kk) = q.shape();
        let mu = q.mean().clone();
        let s = q.variance().clone();
        let gamma = q.binary_prob().clone();

        let dmu = Mat::from_fn(nn, kk, |i, k| -gamma[(i, k)] * mu[(i, k)] / v);
        let ds = Mat::from_fn(nn, kk, |i, k| {
            -0.5 * gamma[(i, k)] * (1.0 / v - 1.0 / s[(i, k)])
        });

        let dgamma = if self.group_spike {
            let pi = self.group_pi();
            let mut dgamma = Mat::zeros(nn, kk);
            for i in 0..nn {
                if kk == 0 {
                    break;
                }
                let g = gamma[(i, 0)];
                let slab: f64 = (0..kk).map(|k| self.slab_kl(mu[(i, k)], s[(i, k)])).sum();
                let d = -((g * (1.0 - pi)) / ((1.0 - g) * pi)).ln() - slab;
                dgamma.row_mut(i).fill(d);
            }
            dgamma
        } else {
            Mat::from_fn(nn, kk, |i, k| {
                let g = gamma[(i, k)];
                let pi = self.pi[k];
                -((g * (1.0 - pi)) / ((1.0 - g) * pi)).ln() - self.slab_kl(mu[(i, k)], s[(i, k)])
            })
        };

        let slots = q.gradient_slots();
        *slots.mean += dmu;
        *slots.variance += ds;
        *slots.binary_prob += dgamma;
        Ok(())
    }

    /// Gradient of `-KL` with respect to `pi`
    pub fn pi_gradient(&self, q: &SpikeSlabPosterior) -> anyhow::Result<DVec> {
        self.check_posterior(q)?;
        let gamma = q.binary_prob();
        let (nn, kk) = q.shape();

        if self.group_spike {
            let pi = self.group_pi();
            let d: f64 = (0..nn)
                .map(|i| {
                    let g = gamma[(i, 0)];
                    g / pi - (1.0 - g) / (1.0 - pi)
                })
                .sum();
            Ok(DVec::from_element(kk, d / kk.max(1) as f64))
        } else {
            Ok(DVec::from_iterator(
                kk,
                (0..kk).map(|k| {
                    let pi = self.pi[k];
                    gamma
                        .column(k)
                        .iter()
                        .map(|&g| g / pi - (1.0 - g) / (1.0 - pi))
                        .sum::<f64>()
                }),
            ))
        }
    }

    /// Store the `pi` gradient reported through [`ParamVector`]
    pub fn set_pi_gradient(&mut self, pi_grad: DVec) -> anyhow::Result<()> {
        check_length("pi gradient", self.pi.len(), pi_grad.len())?;
        self.pi_grad = pi_grad;
        Ok(())
    }

    pub fn reset_pi_gradient(&mut self) {
        self.pi_grad.fill(0.0);
    }
}

/// Exposes `logit(pi)` only when `pi` is learned
impl ParamVector for SpikeSlabPrior {
    fn num_params(&self) -> usize {
        if self.learn_pi {
            self.pi.len()
        } else {
            0
        }
    }

    fn params(&self) -> Vec<f64> {
        if self.learn_pi {
            self.pi.iter().map(|&p| logit(p)).collect()
        } else {
            vec![]
        }
    }

    fn set_params(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        check_length("spike-and-slab prior", self.num_params(), theta.len())?;
        if self.learn_pi {
            for (p, &t) in self.pi.iter_mut().zip(theta.iter()) {
                *p = sigmoid(t).clamp(BINARY_PROB_EPS, 1.0 - BINARY_PROB_EPS);
            }
        }
        Ok(())
    }

    fn gradients(&self) -> Vec<f64> {
        if self.learn_pi {
            self.pi_grad
                .iter()
                .zip(self.pi.iter())
                .map(|(d, p)| d * p * (1.0 - p))
                .collect()
        } else {
            vec![]
        }
    }
}
