//! Test-time option file.
//!
//! Keys follow the upstream DA-CLIP option files (`sde.T`,
//! `network_G.setting.ch_mult`, `path.daclip`, ...) so an existing
//! configuration translates line by line into TOML.

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::source::ModelSource;

/// Width of one attention head in the restoration network.
pub const HEAD_CHANNELS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub sde: SdeOptions,
    #[serde(rename = "network_G", default)]
    pub network_g: NetworkOptions,
    pub path: PathOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SdeOptions {
    /// Stationary noise level, in pixel units when `>= 1`.
    pub max_sigma: f64,
    #[serde(rename = "T")]
    pub t: usize,
    pub schedule: Schedule,
    pub eps: f64,
    pub sampler: SamplerMode,
    pub seed: Option<u64>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Schedule {
    #[default]
    Cosine,
    Linear,
    Constant,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SamplerMode {
    /// Sample from the optimum reverse posterior at every step.
    #[default]
    Posterior,
    /// Euler-Maruyama steps of the reverse-time SDE.
    Sde,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkOptions {
    #[serde(rename = "which_model_G")]
    pub which_model_g: String,
    pub setting: UNetSetting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UNetSetting {
    pub in_nc: usize,
    pub out_nc: usize,
    pub nf: usize,
    pub ch_mult: Vec<usize>,
    pub context_dim: usize,
    pub use_degra_context: bool,
    pub use_image_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathOptions {
    #[serde(rename = "pretrain_model_G")]
    pub pretrain_model_g: ModelSource,
    pub daclip: ModelSource,
}

fn default_name() -> String {
    "universal-ir".to_string()
}

impl Default for SdeOptions {
    fn default() -> Self {
        Self {
            max_sigma: 50.0,
            t: 100,
            schedule: Schedule::Cosine,
            eps: 0.005,
            sampler: SamplerMode::Posterior,
            seed: None,
        }
    }
}

impl SdeOptions {
    /// `max_sigma` on the [0, 1] intensity scale the networks work in.
    pub fn max_sigma_normalized(&self) -> f64 {
        if self.max_sigma >= 1.0 {
            self.max_sigma / 255.0
        } else {
            self.max_sigma
        }
    }
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            which_model_g: "ConditionalUNet".to_string(),
            setting: UNetSetting::default(),
        }
    }
}

impl Default for UNetSetting {
    fn default() -> Self {
        Self {
            in_nc: 3,
            out_nc: 3,
            nf: 64,
            ch_mult: vec![1, 2, 4, 8],
            context_dim: 512,
            use_degra_context: true,
            use_image_context: true,
        }
    }
}

impl Options {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let options: Options =
            toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?;
        options
            .validate()
            .with_context(|| format!("invalid options in {}", path.display()))?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let sde = &self.sde;
        ensure!(sde.t >= 1, "sde.T must be at least 1, got {}", sde.t);
        ensure!(
            sde.eps > 0.0 && sde.eps < 1.0,
            "sde.eps must lie in (0, 1), got {}",
            sde.eps
        );
        ensure!(
            sde.max_sigma > 0.0,
            "sde.max_sigma must be positive, got {}",
            sde.max_sigma
        );

        if self.network_g.which_model_g != "ConditionalUNet" {
            bail!(
                "unsupported network_G.which_model_G {:?}, only ConditionalUNet is available",
                self.network_g.which_model_g
            );
        }

        let setting = &self.network_g.setting;
        ensure!(
            !setting.ch_mult.is_empty(),
            "network_G.setting.ch_mult must not be empty"
        );
        ensure!(
            setting.ch_mult.iter().all(|&m| m > 0),
            "network_G.setting.ch_mult entries must be positive"
        );
        ensure!(
            setting.nf > 0 && setting.nf % HEAD_CHANNELS == 0,
            "network_G.setting.nf must be a positive multiple of {HEAD_CHANNELS}, got {}",
            setting.nf
        );
        ensure!(
            setting.in_nc > 0 && setting.out_nc > 0,
            "network_G.setting.in_nc and out_nc must be positive"
        );
        ensure!(
            setting.context_dim > 0
                || !(setting.use_degra_context || setting.use_image_context),
            "network_G.setting.context_dim must be positive when a context is enabled"
        );
        Ok(())
    }
}
