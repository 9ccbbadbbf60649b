use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MlpError, Result};

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MlpError + '_ {
    move |source| MlpError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes a fitted model (or anything serializable) as pretty JSON.
pub fn save_json<T: Serialize>(path: impl AsRef<Path>, model: &T) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, model)?;
    writer.flush().map_err(io_error(path))?;
    tracing::debug!("saved model to {}", path.display());
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(io_error(path))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
