pub mod activation;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod estimator;
pub mod label;
pub mod lbfgs;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod multinomial;
pub mod network;
pub mod optimizer;
pub mod params;
pub mod persist;
pub mod plot;
pub mod preprocessing;
pub mod regressor;

pub use activation::Activation;
pub use classifier::MlpClassifier;
pub use error::{MlpError, Result};
pub use estimator::TrainingState;
pub use multinomial::{ClassWeight, MultinomialLr};
pub use optimizer::LearningRateSchedule;
pub use params::{BatchSize, MlpParams, Solver};
pub use preprocessing::StandardScaler;
pub use regressor::MlpRegressor;
