/// A block of model parameters seen by an optimizer as a flat vector
/// in an unconstrained space.
///
/// `gradients()` is the gradient of the objective (the evidence) with
/// respect to the same unconstrained coordinates returned by
/// `params()`.
pub trait ParamVector {
    fn num_params(&self) -> usize;

    fn params(&self) -> Vec<f64>;

    fn set_params(&mut self, theta: &[f64]) -> anyhow::Result<()>;

    fn gradients(&self) -> Vec<f64>;
}

/// `1 / (1 + exp(-x))`
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(p / (1 - p))`
pub fn logit(p: f64) -> f64 {
    p.ln() - (-p).ln_1p()
}

/// Positive value from its log, never collapsing to zero
pub fn exp_positive(x: f64) -> f64 {
    x.exp().max(f64::MIN_POSITIVE)
}
