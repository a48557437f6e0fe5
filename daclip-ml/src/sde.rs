//! Mean-reverting SDE (IR-SDE) used to restore images.
//!
//! The forward process drifts a clean image `x0` towards the degraded image
//! `mu` while adding noise whose stationary level is `max_sigma`:
//!
//! `dx = theta_t (mu - x) dt + sigma_t dw`
//!
//! Restoration starts from `mu + max_sigma * N(0, I)` and integrates the
//! reverse process from `t = T` down to `t = 1`, with a network estimating
//! the noise at every step.

use anyhow::{Result, ensure};
use candle_core::Tensor;
use daclip_core::options::{SamplerMode, Schedule, SdeOptions};
use tracing::instrument;

/// Smallest posterior variance, relative to `dt`, before taking its log.
const MIN_POSTERIOR_VARIANCE: f64 = 1e-20;

/// Embeddings the noise network is conditioned on.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    pub degradation: Option<Tensor>,
    pub image: Option<Tensor>,
}

/// Estimates the noise component of an SDE state.
pub trait NoisePredictor {
    fn predict_noise(
        &self,
        xt: &Tensor,
        mu: &Tensor,
        t: usize,
        context: &Conditioning,
    ) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
pub struct IrSde {
    max_sigma: f64,
    steps: usize,
    dt: f64,
    thetas: Vec<f64>,
    sigmas: Vec<f64>,
    thetas_cumsum: Vec<f64>,
    sigma_bars: Vec<f64>,
}

impl IrSde {
    /// `max_sigma` is on the [0, 1] intensity scale.
    pub fn new(max_sigma: f64, steps: usize, schedule: Schedule, eps: f64) -> Result<Self> {
        ensure!(steps >= 1, "the SDE needs at least one step");
        ensure!(eps > 0.0 && eps < 1.0, "eps must lie in (0, 1), got {eps}");
        ensure!(max_sigma > 0.0, "max_sigma must be positive, got {max_sigma}");

        let thetas = match schedule {
            Schedule::Cosine => cosine_theta_schedule(steps, 0.008),
            Schedule::Linear => linear_theta_schedule(steps),
            Schedule::Constant => vec![1.0; steps + 1],
        };

        let variance = max_sigma * max_sigma;
        let sigmas = thetas.iter().map(|&theta| (variance * 2.0 * theta).sqrt()).collect();

        let first = thetas[0];
        let thetas_cumsum: Vec<f64> = thetas
            .iter()
            .scan(0.0, |acc, &theta| {
                *acc += theta;
                Some(*acc - first)
            })
            .collect();

        let total = thetas_cumsum[steps];
        ensure!(total > 0.0, "theta schedule integrates to zero");
        let dt = -eps.ln() / total;

        let sigma_bars = thetas_cumsum
            .iter()
            .map(|&cumsum| (variance * (1.0 - (-2.0 * cumsum * dt).exp())).sqrt())
            .collect();

        Ok(Self {
            max_sigma,
            steps,
            dt,
            thetas,
            sigmas,
            thetas_cumsum,
            sigma_bars,
        })
    }

    pub fn from_options(options: &SdeOptions) -> Result<Self> {
        Self::new(
            options.max_sigma_normalized(),
            options.t,
            options.schedule,
            options.eps,
        )
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn max_sigma(&self) -> f64 {
        self.max_sigma
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn thetas(&self) -> &[f64] {
        &self.thetas
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn thetas_cumsum(&self) -> &[f64] {
        &self.thetas_cumsum
    }

    pub fn sigma_bars(&self) -> &[f64] {
        &self.sigma_bars
    }

    /// Starting state for restoration: `x + max_sigma * N(0, I)`.
    pub fn noise_state(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs + (xs.randn_like(0.0, 1.0)? * self.max_sigma)?
    }

    /// Mean of the forward marginal at `t`.
    pub fn mu_bar(&self, x0: &Tensor, mu: &Tensor, t: usize) -> candle_core::Result<Tensor> {
        let decay = (-self.thetas_cumsum[t] * self.dt).exp();
        ((x0 - mu)? * decay)? + mu
    }

    /// Drift of the reverse-time SDE, already scaled by `dt`.
    pub fn sde_reverse_drift(
        &self,
        xs: &Tensor,
        mu: &Tensor,
        score: &Tensor,
        t: usize,
    ) -> candle_core::Result<Tensor> {
        let mean_reversion = ((mu - xs)? * self.thetas[t])?;
        let score_term = (score * (self.sigmas[t] * self.sigmas[t]))?;
        ((mean_reversion - score_term)? * self.dt)
    }

    /// Brownian increment of the reverse SDE.
    pub fn dispersion(&self, xs: &Tensor, t: usize) -> candle_core::Result<Tensor> {
        xs.randn_like(0.0, 1.0)? * (self.sigmas[t] * self.dt.sqrt())
    }

    pub fn reverse_sde_step(
        &self,
        xs: &Tensor,
        mu: &Tensor,
        score: &Tensor,
        t: usize,
    ) -> candle_core::Result<Tensor> {
        let drift = self.sde_reverse_drift(xs, mu, score, t)?;
        (xs - drift)? - self.dispersion(xs, t)?
    }

    pub fn score_from_noise(&self, noise: &Tensor, t: usize) -> candle_core::Result<Tensor> {
        noise * (-1.0 / self.sigma_bars[t])
    }

    /// Clean image implied by state `xt` containing `noise` at step `t`.
    pub fn init_state_from_noise(
        &self,
        xt: &Tensor,
        mu: &Tensor,
        noise: &Tensor,
        t: usize,
    ) -> candle_core::Result<Tensor> {
        let growth = (self.thetas_cumsum[t] * self.dt).exp();
        let centered = ((xt - mu)? - (noise * self.sigma_bars[t])?)?;
        (centered * growth)? + mu
    }

    /// Mean of `p(x_{t-1} | x_t, x_0)`.
    pub fn reverse_optimum_step(
        &self,
        xt: &Tensor,
        x0: &Tensor,
        mu: &Tensor,
        t: usize,
    ) -> candle_core::Result<Tensor> {
        let (term1, term2) = self.optimum_coefficients(t);
        let from_state = ((xt - mu)? * term1)?;
        let from_clean = ((x0 - mu)? * term2)?;
        (from_state + from_clean)? + mu
    }

    fn optimum_coefficients(&self, t: usize) -> (f64, f64) {
        let a = (-self.thetas[t] * self.dt).exp();
        let b = (-self.thetas_cumsum[t] * self.dt).exp();
        let c = (-self.thetas_cumsum[t - 1] * self.dt).exp();
        let denom = 1.0 - b * b;
        (a * (1.0 - c * c) / denom, c * (1.0 - a * a) / denom)
    }

    /// Standard deviation of `p(x_{t-1} | x_t, x_0)`.
    pub fn reverse_optimum_std(&self, t: usize) -> f64 {
        let a = (-2.0 * self.thetas[t] * self.dt).exp();
        let b = (-2.0 * self.thetas_cumsum[t] * self.dt).exp();
        let c = (-2.0 * self.thetas_cumsum[t - 1] * self.dt).exp();
        let variance = (1.0 - a) * (1.0 - c) / (1.0 - b);
        let log_variance = variance.max(MIN_POSTERIOR_VARIANCE * self.dt).ln();
        (0.5 * log_variance).exp() * self.max_sigma
    }

    pub fn reverse_posterior_step(
        &self,
        xt: &Tensor,
        mu: &Tensor,
        noise: &Tensor,
        t: usize,
    ) -> candle_core::Result<Tensor> {
        let x0 = self.init_state_from_noise(xt, mu, noise, t)?;
        let mean = self.reverse_optimum_step(xt, &x0, mu, t)?;
        let std = self.reverse_optimum_std(t);
        mean + (xt.randn_like(0.0, 1.0)? * std)?
    }

    /// Integrate the reverse SDE from `T` down to 1.
    #[instrument(level = "info", skip_all, fields(steps = self.steps))]
    pub fn reverse_sde(
        &self,
        model: &impl NoisePredictor,
        xt: &Tensor,
        mu: &Tensor,
        context: &Conditioning,
    ) -> Result<Tensor> {
        let mut xs = xt.clone();
        for t in (1..=self.steps).rev() {
            let noise = model.predict_noise(&xs, mu, t, context)?;
            let score = self.score_from_noise(&noise, t)?;
            xs = self.reverse_sde_step(&xs, mu, &score, t)?;
        }
        Ok(xs)
    }

    /// Sample the optimum reverse posterior from `T` down to 1.
    #[instrument(level = "info", skip_all, fields(steps = self.steps))]
    pub fn reverse_posterior(
        &self,
        model: &impl NoisePredictor,
        xt: &Tensor,
        mu: &Tensor,
        context: &Conditioning,
    ) -> Result<Tensor> {
        let mut xs = xt.clone();
        for t in (1..=self.steps).rev() {
            let noise = model.predict_noise(&xs, mu, t, context)?;
            xs = self.reverse_posterior_step(&xs, mu, &noise, t)?;
        }
        Ok(xs)
    }

    pub fn reverse(
        &self,
        mode: SamplerMode,
        model: &impl NoisePredictor,
        xt: &Tensor,
        mu: &Tensor,
        context: &Conditioning,
    ) -> Result<Tensor> {
        match mode {
            SamplerMode::Posterior => self.reverse_posterior(model, xt, mu, context),
            SamplerMode::Sde => self.reverse_sde(model, xt, mu, context),
        }
    }
}

/// Cosine schedule over `steps + 1` entries, indices `0..=steps`.
fn cosine_theta_schedule(steps: usize, s: f64) -> Vec<f64> {
    let timesteps = (steps + 2) as f64;
    let alphas_cumprod: Vec<f64> = (0..steps + 3)
        .map(|i| {
            let x = i as f64;
            (((x / timesteps) + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2)
                .cos()
                .powi(2)
        })
        .collect();
    let first = alphas_cumprod[0];
    alphas_cumprod[1..steps + 2]
        .iter()
        .map(|alpha| 1.0 - alpha / first)
        .collect()
}

/// Linear schedule over `steps + 1` entries, scaled like DDPM's 1000-step betas.
fn linear_theta_schedule(steps: usize) -> Vec<f64> {
    let n = steps + 1;
    let scale = 1000.0 / n as f64;
    let (start, end) = (scale * 1e-4, scale * 2e-2);
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_schedule_is_increasing() {
        let thetas = cosine_theta_schedule(100, 0.008);
        assert_eq!(thetas.len(), 101);
        assert!(thetas.windows(2).all(|w| w[0] < w[1]));
        assert!(thetas[0] > 0.0);
    }

    #[test]
    fn linear_schedule_endpoints() {
        let thetas = linear_theta_schedule(99);
        assert_eq!(thetas.len(), 100);
        assert!((thetas[0] - 0.001).abs() < 1e-12);
        assert!((thetas[99] - 0.2).abs() < 1e-12);
    }
}
