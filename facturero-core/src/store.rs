//! Artifact persistence: one XML file per observed state, named by
//! access key and timestamp under `comprobantes/<estado>/`.

use crate::access_key::AccessKey;
use crate::api::DocumentState;
use crate::clock;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state {0} is transient and is never persisted")]
    TransientState(&'static str),
}

/// Content-addressed store for signed and authorized XML, rooted at a
/// base directory.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    base: PathBuf,
}

impl DocumentStore {
    pub fn new(base: impl Into<PathBuf>) -> DocumentStore {
        DocumentStore { base: base.into() }
    }

    /// Directory for a given state, under `comprobantes/`.
    pub fn state_dir(&self, state: DocumentState) -> Option<PathBuf> {
        state
            .dir_name()
            .map(|dir| self.base.join("comprobantes").join(dir))
    }

    /// Persist `xml` for `key` under the given state. The write goes to
    /// a temporary sibling first and is renamed into place, so a
    /// cancelled task never leaves a half-written artifact.
    pub fn save(
        &self,
        state: DocumentState,
        key: &AccessKey,
        xml: &str,
    ) -> Result<PathBuf, StoreError> {
        let dir = self
            .state_dir(state)
            .ok_or(StoreError::TransientState(state.as_str()))?;
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let timestamp = clock::now_in_ecuador().format("%Y%m%d-%H%M%S");
        let file_name = format!("{key}_{timestamp}.xml");
        let target = dir.join(&file_name);
        let temporary = dir.join(format!(".{file_name}.tmp"));

        write_atomic(&temporary, &target, xml.as_bytes())?;
        debug!(
            target: "sri",
            state = state.as_str(),
            clave_acceso = key.as_str(),
            path = %target.display(),
            "persisted comprobante artifact"
        );
        Ok(target)
    }
}

fn write_atomic(temporary: &Path, target: &Path, contents: &[u8]) -> Result<(), StoreError> {
    std::fs::write(temporary, contents).map_err(|e| StoreError::Io {
        path: temporary.to_path_buf(),
        source: e,
    })?;
    std::fs::rename(temporary, target).map_err(|e| {
        let _ = std::fs::remove_file(temporary);
        StoreError::Io {
            path: target.to_path_buf(),
            source: e,
        }
    })
}
