use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::TargetColumn;
use crate::error::{MlpError, Result};
use crate::params::MlpParams;

/// Which estimator the command line tool trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Classification,
    Regression,
    /// Multinomial logistic regression; only `alpha` is read from the
    /// model parameters.
    Multinomial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub path: PathBuf,
    pub target: TargetColumn,
    /// Fraction of samples held out for evaluation.
    pub test_ratio: f64,
    /// Standardise features using statistics of the training part.
    pub scale: bool,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/train.csv"),
            target: TargetColumn::Last,
            test_ratio: 0.25,
            scale: true,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub task: Task,
    pub params: MlpParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where to write the fitted model as JSON.
    pub model: Option<PathBuf>,
    /// Where to draw the loss curve as SVG.
    pub plot: Option<PathBuf>,
}

/// Command line tool configuration, read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MlpError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.data.test_ratio > 0.0 && self.data.test_ratio < 1.0) {
            return Err(MlpError::invalid(
                "data.test_ratio",
                format!("must be in (0, 1), got {}", self.data.test_ratio),
            ));
        }
        self.model.params.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Solver;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [data]
            path = "iris.csv"
            target = { name = "species" }
            test_ratio = 0.3

            [model]
            task = "classification"

            [model.params]
            hidden_layer_sizes = [10]
            solver = "lbfgs"
            random_state = 37

            [output]
            plot = "loss.svg"
            "#,
        )
        .unwrap();

        assert_eq!(config.data.path, PathBuf::from("iris.csv"));
        assert_eq!(config.data.target, TargetColumn::Name("species".to_owned()));
        assert!(config.data.scale);
        assert_eq!(config.model.params.solver, Solver::Lbfgs);
        assert_eq!(config.output.plot, Some(PathBuf::from("loss.svg")));
        assert_eq!(config.output.model, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model.task, Task::Classification);
    }

    #[test]
    fn rejects_bad_test_ratio() {
        let mut config = Config::default();
        config.data.test_ratio = 1.0;
        assert!(config.validate().is_err());
    }
}
