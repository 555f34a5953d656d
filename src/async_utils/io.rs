//! File I/O helpers: config files in, reports out.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Read a TOML or JSON file, choosing the parser by extension. Anything
/// other than `.json` is parsed as TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create a writer for either a file or standard output.
pub async fn create_writer(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write `data` to either a file or standard output, then flush.
pub async fn write_output(path: Option<&Path>, data: &[u8]) -> Result<()> {
    let mut wtr = create_writer(path).await?;
    wtr.write_all(data)
        .await
        .context("Failed to write output")?;
    wtr.flush().await.context("Failed to flush output")?;
    Ok(())
}
