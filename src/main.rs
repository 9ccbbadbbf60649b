use std::path::PathBuf;

use mlp::{
    config::{Config, Task},
    dataset::{self, Dataset},
    logging, persist, plot, MlpClassifier, MlpRegressor, MultinomialLr, StandardScaler,
    TrainingState,
};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "mlp.toml";

struct Split {
    train: Vec<usize>,
    test: Vec<usize>,
    x_train: Array2<f64>,
    y_train: Vec<String>,
    x_test: Array2<f64>,
    y_test: Vec<String>,
}

fn split(dataset: &Dataset, config: &Config) -> Result<Split, mlp::MlpError> {
    let mut rng = StdRng::seed_from_u64(config.data.seed);
    let (train, test) =
        dataset::train_test_split(dataset.n_samples(), config.data.test_ratio, &mut rng);

    let mut x_train = dataset::take_rows(dataset.features.view(), &train);
    let mut x_test = dataset::take_rows(dataset.features.view(), &test);
    if config.data.scale {
        let scaler = StandardScaler::fit(x_train.view())?;
        x_train = scaler.transform(x_train.view())?;
        x_test = scaler.transform(x_test.view())?;
    }

    let pick = |indices: &[usize]| -> Vec<String> {
        indices.iter().map(|&i| dataset.targets[i].clone()).collect()
    };

    Ok(Split {
        y_train: pick(&train),
        y_test: pick(&test),
        train,
        test,
        x_train,
        x_test,
    })
}

fn report(state: &TrainingState, config: &Config) -> Result<(), mlp::MlpError> {
    info!(
        iterations = state.n_iter(),
        loss = state.loss().unwrap_or(f64::NAN),
        "training finished"
    );
    if let Some(path) = &config.output.plot {
        plot::plot_loss_curve(path, state.loss_curve(), state.validation_scores())?;
        info!(path = %path.display(), "loss curve written");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = Config::load(&config_path)?;

    let dataset = dataset::load_csv(&config.data.path, &config.data.target)?;
    info!(
        samples = dataset.n_samples(),
        features = dataset.n_features(),
        path = %config.data.path.display(),
        "dataset loaded"
    );

    let data = split(&dataset, &config)?;
    let params = config.model.params.clone();

    match config.model.task {
        Task::Classification => {
            let mut model = MlpClassifier::new(params);
            model.fit(data.x_train.view(), &data.y_train)?;
            report(model.state()?, &config)?;

            let train = model.score(data.x_train.view(), &data.y_train)? * 100.0;
            let test = model.score(data.x_test.view(), &data.y_test)? * 100.0;
            println!("mlp classifier train accuracy: {train:.3}%");
            println!("mlp classifier test accuracy: {test:.3}%");

            if let Some(path) = &config.output.model {
                persist::save_json(path, &model)?;
            }
        }
        Task::Regression => {
            let targets = Array1::from(dataset.targets_as_f64()?);
            let y_train = targets.select(Axis(0), &data.train);
            let y_test = targets.select(Axis(0), &data.test);

            let mut model = MlpRegressor::new(params);
            model.fit_single(data.x_train.view(), y_train.view())?;
            report(model.state()?, &config)?;

            let train = model.score(data.x_train.view(), y_train.view().insert_axis(Axis(1)))?;
            let test = model.score(data.x_test.view(), y_test.view().insert_axis(Axis(1)))?;
            println!("mlp regressor train R²: {train:.4}");
            println!("mlp regressor test R²: {test:.4}");

            if let Some(path) = &config.output.model {
                persist::save_json(path, &model)?;
            }
        }
        Task::Multinomial => {
            let mut model = MultinomialLr::new(params.alpha);
            model.fit(data.x_train.view(), &data.y_train)?;
            info!(iterations = model.n_iter()?, loss = model.loss()?, "training finished");

            let train = model.score(data.x_train.view(), &data.y_train)? * 100.0;
            let test = model.score(data.x_test.view(), &data.y_test)? * 100.0;
            println!("multinomial regression train accuracy: {train:.3}%");
            println!("multinomial regression test accuracy: {test:.3}%");

            if let Some(path) = &config.output.model {
                persist::save_json(path, &model)?;
            }
        }
    }

    if let Some(path) = &config.output.model {
        info!(path = %path.display(), "model saved");
    }

    Ok(())
}
