use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::ReaderBuilder;
use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MlpError, Result};

/// Column of a CSV file holding the targets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetColumn {
    #[default]
    Last,
    Index(usize),
    Name(String),
}

/// Numeric features with raw target strings, as read from a CSV file.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Array2<f64>,
    pub targets: Vec<String>,
}

impl Dataset {
    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Targets parsed as numbers, for regression.
    pub fn targets_as_f64(&self) -> Result<Vec<f64>> {
        self.targets
            .iter()
            .enumerate()
            .map(|(row, value)| {
                value.trim().parse::<f64>().map_err(|_| MlpError::Parse {
                    row,
                    column: self.n_features(),
                    value: value.clone(),
                })
            })
            .collect()
    }
}

pub fn load_csv(path: impl AsRef<Path>, target: &TargetColumn) -> Result<Dataset> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| MlpError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_csv(BufReader::new(file), target)
}

/// Reads a CSV with a header row. Every column except the target must be
/// numeric.
pub fn read_csv<R: Read>(reader: R, target: &TargetColumn) -> Result<Dataset> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(reader);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
    let target_index = match target {
        TargetColumn::Last => headers
            .len()
            .checked_sub(1)
            .ok_or_else(|| MlpError::MissingColumn("last".to_owned()))?,
        TargetColumn::Index(index) if *index < headers.len() => *index,
        TargetColumn::Index(index) => return Err(MlpError::MissingColumn(index.to_string())),
        TargetColumn::Name(name) => headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| MlpError::MissingColumn(name.clone()))?,
    };

    let feature_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|&(index, _)| index != target_index)
        .map(|(_, name)| name.clone())
        .collect();

    let mut values = Vec::new();
    let mut targets = Vec::new();

    for (row, result) in reader.records().enumerate() {
        let record = result?;

        for (column, value) in record.iter().enumerate() {
            if column == target_index {
                targets.push(value.to_owned());
                continue;
            }
            let parsed = value.trim().parse::<f64>().map_err(|_| MlpError::Parse {
                row,
                column,
                value: value.to_owned(),
            })?;
            values.push(parsed);
        }
    }

    if targets.is_empty() {
        return Err(MlpError::EmptyInput);
    }

    let features = Array2::from_shape_vec((targets.len(), feature_names.len()), values)
        .map_err(|err| MlpError::invalid("csv", err.to_string()))?;

    Ok(Dataset {
        feature_names,
        features,
        targets,
    })
}

/// Shuffled `(train, test)` index split. The test part holds
/// `ceil(n * test_ratio)` samples.
pub fn train_test_split<R: Rng + ?Sized>(
    n_samples: usize,
    test_ratio: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n_samples).collect();
    indices.shuffle(rng);

    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    let test_size = ((n_samples as f64 * test_ratio).ceil() as usize).min(n_samples);
    let test = indices.split_off(n_samples - test_size);

    (indices, test)
}

/// Like [`train_test_split`] but keeps the proportion of each stratum in
/// both parts.
pub fn stratified_split<R: Rng + ?Sized>(
    strata: &[usize],
    test_ratio: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, &stratum) in strata.iter().enumerate() {
        groups.entry(stratum).or_default().push(index);
    }

    let mut train = Vec::with_capacity(strata.len());
    let mut test = Vec::new();
    for mut members in groups.into_values() {
        members.shuffle(rng);

        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let test_size = ((members.len() as f64 * test_ratio).round() as usize).min(members.len());
        test.extend(members.drain(..test_size));
        train.extend(members);
    }

    train.shuffle(rng);
    test.shuffle(rng);
    (train, test)
}

pub fn take_rows(values: ArrayView2<f64>, indices: &[usize]) -> Array2<f64> {
    values.select(Axis(0), indices)
}
