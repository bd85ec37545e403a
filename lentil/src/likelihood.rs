use crate::common::*;
use crate::error::check_dim;
use matrix_param::traits::exp_positive;

/// `y[n,d] = f_d(x_n) + e`, `e ~ N(0, variance)`
#[derive(Debug, Clone)]
pub struct GaussianNoise {
    variance: f64,
    variance_grad: f64,
}

impl GaussianNoise {
    pub fn new(variance: f64) -> anyhow::Result<Self> {
        if !(variance > 0.0 && variance.is_finite()) {
            return Err(LentilError::Numerical(format!(
                "noise variance must be positive, found {}",
                variance
            ))
            .into());
        }
        Ok(Self {
            variance,
            variance_grad: 0.0,
        })
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn precision(&self) -> f64 {
        1.0 / self.variance
    }

    /// Gradient of the evidence w.r.t. the variance itself
    pub fn set_gradient(&mut self, dl_dvariance: f64) {
        self.variance_grad = dl_dvariance;
    }
}

/// `ln(variance)`
impl ParamVector for GaussianNoise {
    fn num_params(&self) -> usize {
        1
    }

    fn params(&self) -> Vec<f64> {
        vec![self.variance.ln()]
    }

    fn set_params(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        check_dim("noise parameters", 1, theta.len())?;
        self.variance = exp_positive(theta[0]);
        Ok(())
    }

    fn gradients(&self) -> Vec<f64> {
        vec![self.variance_grad * self.variance]
    }
}
