//! A [`Persistence`] that writes one JSON report per product.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::capability::Persistence;
use crate::error::{Error, ProviderError};
use crate::result::PipelineResult;

/// Writes `<dir>/<product_id>.json` with the image-free result summary.
#[derive(Debug, Clone)]
pub struct JsonReportStore {
    dir: PathBuf,
}

impl JsonReportStore {
    /// Store reports under `dir`, created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory reports are written to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Report path for `product_id`. Path separators and other unsafe
    /// characters are replaced with `_`.
    #[must_use]
    pub fn path_for(&self, product_id: &str) -> PathBuf {
        let name: String = product_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.trim_matches('.').is_empty() {
            "_".to_string()
        } else {
            name
        };
        self.dir.join(format!("{name}.json"))
    }
}

impl Persistence for JsonReportStore {
    fn save(&self, product_id: &str, result: &PipelineResult) -> Result<(), ProviderError> {
        std::fs::create_dir_all(&self.dir).map_err(Error::Io)?;
        let path = self.path_for(product_id);
        let json = serde_json::to_vec_pretty(&result.report(product_id)).map_err(Error::Json)?;
        std::fs::write(&path, json).map_err(Error::Io)?;
        debug!(path = %path.display(), "report written");
        Ok(())
    }
}
