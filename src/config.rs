use std::fmt;

use anyhow::{ensure, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// How the median-flow tracker seeds points inside its box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PointDistribution {
    /// `len_points × len_points` regular grid.
    Grid,
    /// `total_num_points` uniformly random points.
    Random,
}

/// What the object model does with a new template once a buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    /// Evict the oldest template.
    Fifo,
    /// Overwrite a uniformly random slot.
    Random,
}

/// Tracker parameters. Every component receives its own copy at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, clap::Parser)]
#[serde(default)]
pub struct Config {
    #[clap(long, default_value = "42")]
    pub seed: u64,

    // median flow tracker
    /// Points per side of the tracking grid.
    #[clap(long, default_value = "10")]
    pub len_points: usize,
    /// Number of points when they are drawn at random.
    #[clap(long, default_value = "100")]
    pub total_num_points: usize,
    #[clap(long, value_enum, default_value = "random")]
    pub point_distribution: PointDistribution,
    /// Lucas-Kanade window side in pixels.
    #[clap(long, default_value = "15")]
    pub lk_win_size: usize,
    /// Coarsest pyramid level used by Lucas-Kanade (0 = no pyramid).
    #[clap(long, default_value = "3")]
    pub max_pyr_level: usize,
    #[clap(long, default_value = "10")]
    pub lk_max_iterations: usize,
    #[clap(long, default_value = "0.03")]
    pub lk_epsilon: f64,
    /// Minimum eigenvalue of the normalized structure tensor at level 0.
    #[clap(long, default_value = "1e-4")]
    pub lk_min_eigenvalue: f64,
    /// Side of the patches compared by the correlation check.
    #[clap(long, default_value = "10")]
    pub ncc_patch_size: usize,
    /// Maximum median forward-backward error in pixels.
    #[clap(long, default_value = "10.0")]
    pub fb_threshold: f64,
    #[clap(long, default_value = "10.0")]
    pub max_median_displacement: f64,

    // cascade classifier
    /// Fraction of the initial patch variance below which windows are rejected.
    #[clap(long, default_value = "0.7")]
    pub variance_fraction: f64,
    /// IoU above which detections are clustered together.
    #[clap(long, default_value = "0.5")]
    pub overlap_threshold: f64,
    #[clap(long, default_value = "5")]
    pub num_ferns: usize,
    /// Pixel comparisons per fern.
    #[clap(long, default_value = "4")]
    pub num_binary_features: usize,
    #[clap(long, default_value = "0.2")]
    pub scale_step: f64,
    #[clap(long, default_value = "0.2")]
    pub min_scale: f64,
    #[clap(long, default_value = "2.2")]
    pub max_scale: f64,
    /// Horizontal sliding step as a fraction of the initial box width.
    #[clap(long, default_value = "0.1")]
    pub width_fraction: f64,
    /// Vertical sliding step as a fraction of the initial box height.
    #[clap(long, default_value = "0.1")]
    pub height_fraction: f64,
    /// Minimum sliding window area in pixels.
    #[clap(long, default_value = "25.0")]
    pub min_area: f64,
    #[clap(long, default_value = "0.7")]
    pub theta_plus: f64,
    #[clap(long, default_value = "0.65")]
    pub theta_minus: f64,

    // object model
    #[clap(long, value_enum, default_value = "fifo")]
    pub replacement_policy: ReplacementPolicy,
    /// Side of the square templates kept by the object model.
    #[clap(long, default_value = "15")]
    pub template_size: usize,
    #[clap(long, default_value = "20")]
    pub init_obj_model_size: usize,
    #[clap(long, default_value = "40")]
    pub max_obj_model_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["tld-rust"])
    }
}

impl Config {
    /// Reject parameter combinations the tracker cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.len_points > 0, "len_points must be positive");
        ensure!(self.total_num_points > 0, "total_num_points must be positive");
        ensure!(self.lk_win_size > 0, "lk_win_size must be positive");
        ensure!(self.lk_max_iterations > 0, "lk_max_iterations must be positive");
        ensure!(self.lk_epsilon > 0., "lk_epsilon must be positive");
        ensure!(self.ncc_patch_size > 0, "ncc_patch_size must be positive");
        ensure!(self.fb_threshold >= 0., "fb_threshold must not be negative");
        ensure!(
            self.max_median_displacement >= 0.,
            "max_median_displacement must not be negative"
        );
        ensure!(
            self.variance_fraction >= 0.,
            "variance_fraction must not be negative"
        );
        ensure!(
            (0. ..=1.).contains(&self.overlap_threshold),
            "overlap_threshold must lie in [0, 1]"
        );
        ensure!(self.num_ferns > 0, "num_ferns must be positive");
        ensure!(
            (1..=16).contains(&self.num_binary_features),
            "num_binary_features must lie in 1..=16, got {}",
            self.num_binary_features
        );
        ensure!(self.scale_step > 0., "scale_step must be positive");
        ensure!(
            self.min_scale > 0. && self.min_scale <= self.max_scale,
            "scale range [{}, {}] is empty",
            self.min_scale,
            self.max_scale
        );
        ensure!(
            self.width_fraction > 0. && self.height_fraction > 0.,
            "sliding window fractions must be positive"
        );
        ensure!(
            self.theta_minus <= self.theta_plus,
            "theta_minus ({}) exceeds theta_plus ({})",
            self.theta_minus,
            self.theta_plus
        );
        ensure!(self.template_size > 1, "template_size must be at least 2");
        ensure!(
            self.init_obj_model_size > 0,
            "init_obj_model_size must be positive"
        );
        ensure!(
            self.init_obj_model_size <= self.max_obj_model_size,
            "init_obj_model_size ({}) exceeds max_obj_model_size ({})",
            self.init_obj_model_size,
            self.max_obj_model_size
        );
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "seed: {}", self.seed)?;
        writeln!(f, "median flow tracker:")?;
        writeln!(f, "  len_points: {}", self.len_points)?;
        writeln!(f, "  total_num_points: {}", self.total_num_points)?;
        writeln!(f, "  point_distribution: {:?}", self.point_distribution)?;
        writeln!(f, "  lk_win_size: {}", self.lk_win_size)?;
        writeln!(f, "  max_pyr_level: {}", self.max_pyr_level)?;
        writeln!(f, "  lk_max_iterations: {}", self.lk_max_iterations)?;
        writeln!(f, "  lk_epsilon: {}", self.lk_epsilon)?;
        writeln!(f, "  lk_min_eigenvalue: {}", self.lk_min_eigenvalue)?;
        writeln!(f, "  ncc_patch_size: {}", self.ncc_patch_size)?;
        writeln!(f, "  fb_threshold: {}", self.fb_threshold)?;
        writeln!(f, "  max_median_displacement: {}", self.max_median_displacement)?;
        writeln!(f, "cascade classifier:")?;
        writeln!(f, "  variance_fraction: {}", self.variance_fraction)?;
        writeln!(f, "  overlap_threshold: {}", self.overlap_threshold)?;
        writeln!(f, "  num_ferns: {}", self.num_ferns)?;
        writeln!(f, "  num_binary_features: {}", self.num_binary_features)?;
        writeln!(
            f,
            "  scales: {}..={} step {}",
            self.min_scale, self.max_scale, self.scale_step
        )?;
        writeln!(f, "  width_fraction: {}", self.width_fraction)?;
        writeln!(f, "  height_fraction: {}", self.height_fraction)?;
        writeln!(f, "  min_area: {}", self.min_area)?;
        writeln!(f, "  theta_plus: {}", self.theta_plus)?;
        writeln!(f, "  theta_minus: {}", self.theta_minus)?;
        writeln!(f, "object model:")?;
        writeln!(f, "  replacement_policy: {:?}", self.replacement_policy)?;
        writeln!(f, "  template_size: {}", self.template_size)?;
        writeln!(f, "  init_obj_model_size: {}", self.init_obj_model_size)?;
        write!(f, "  max_obj_model_size: {}", self.max_obj_model_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_flags() {
        let config = Config::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.point_distribution, PointDistribution::Random);
        assert_eq!(config.replacement_policy, ReplacementPolicy::Fifo);
        assert!((config.theta_plus - 0.7).abs() < 1e-12);
        assert!((config.theta_minus - 0.65).abs() < 1e-12);
        assert!((config.lk_min_eigenvalue - 1e-4).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse_from([
            "tld-rust",
            "--num-ferns",
            "8",
            "--point-distribution",
            "grid",
            "--replacement-policy",
            "random",
        ]);
        assert_eq!(config.num_ferns, 8);
        assert_eq!(config.point_distribution, PointDistribution::Grid);
        assert_eq!(config.replacement_policy, ReplacementPolicy::Random);
    }

    #[test]
    fn test_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"seed": 7, "point_distribution": "grid"}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.point_distribution, PointDistribution::Grid);
        assert_eq!(config.num_ferns, Config::default().num_ferns);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.theta_minus = 0.9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.num_binary_features = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.init_obj_model_size = 100;
        assert!(config.validate().is_err());
    }
}
