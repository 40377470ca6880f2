//! Persistence of fitted models, their normalizers and calibration metadata
//!
//! Layout: `<root>/<modality>/<kind>/{model,normalizer,meta}.<ext>`. Each file
//! is written to a temporary sibling and renamed into place; the metadata file
//! is written last. Loading validates the whole set and reports anything
//! inconsistent as absent.

pub mod format;
pub mod metadata;

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{ScoringError, StoreError};
use crate::ml::{Normalizer, TrainableScorer};
use crate::models::{Modality, ModelKind};

pub use format::{ArtifactFormat, JsonFormat};
pub use metadata::{Calibration, ModelMetadata};

const MODEL_FILE: &str = "model";
const NORMALIZER_FILE: &str = "normalizer";
const META_FILE: &str = "meta";

/// A validated set of persisted artifacts
#[derive(Debug, Clone)]
pub struct StoredModel<M> {
    pub model: M,
    pub normalizer: Normalizer,
    pub metadata: ModelMetadata,
}

#[derive(Debug, Clone)]
pub struct ModelStore<F: ArtifactFormat = JsonFormat> {
    root: PathBuf,
    format: F,
}

impl ModelStore<JsonFormat> {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        ModelStore::with_format(root, JsonFormat)
    }
}

impl<F: ArtifactFormat> ModelStore<F> {
    pub fn with_format<P: Into<PathBuf>>(root: P, format: F) -> Self {
        ModelStore {
            root: root.into(),
            format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, modality: Modality, kind: ModelKind) -> PathBuf {
        self.root.join(modality.as_str()).join(kind.as_str())
    }

    fn artifact_path(&self, modality: Modality, kind: ModelKind, name: &str) -> PathBuf {
        self.artifact_dir(modality, kind)
            .join(format!("{}.{}", name, self.format.extension()))
    }

    pub fn save<M: TrainableScorer>(
        &self,
        modality: Modality,
        kind: ModelKind,
        model: &M,
        normalizer: &Normalizer,
        metadata: &ModelMetadata,
    ) -> Result<(), StoreError> {
        let dir = self.artifact_dir(modality, kind);
        fs::create_dir_all(&dir)?;

        self.write_atomic(&self.artifact_path(modality, kind, MODEL_FILE), model)?;
        self.write_atomic(&self.artifact_path(modality, kind, NORMALIZER_FILE), normalizer)?;
        self.write_atomic(&self.artifact_path(modality, kind, META_FILE), metadata)?;

        info!(
            "[{}-{}] Saved {} artifact {} to {}",
            modality,
            kind,
            metadata.model,
            metadata.artifact_id,
            dir.display()
        );
        Ok(())
    }

    fn write_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = self.format.encode(value)?;
        let tmp = path.with_extension(format!("{}.tmp", self.format.extension()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load and validate a persisted model; any missing or inconsistent piece yields `None`
    pub fn load<M: TrainableScorer>(&self, modality: Modality, kind: ModelKind) -> Option<StoredModel<M>> {
        if !self.artifact_path(modality, kind, META_FILE).exists() {
            debug!("[{}-{}] No persisted model found", modality, kind);
            return None;
        }

        match self.try_load(modality, kind) {
            Ok(stored) => {
                info!(
                    "[{}-{}] Loaded artifact {} saved at {}",
                    modality, kind, stored.metadata.artifact_id, stored.metadata.saved_at
                );
                Some(stored)
            }
            Err(e) => {
                let err = ScoringError::InvalidPersistedState {
                    modality,
                    kind,
                    reason: e.to_string(),
                };
                warn!("[{}-{}] Ignoring persisted model: {}", modality, kind, err);
                None
            }
        }
    }

    fn try_load<M: TrainableScorer>(&self, modality: Modality, kind: ModelKind) -> Result<StoredModel<M>, StoreError> {
        let read = |name: &str| fs::read(self.artifact_path(modality, kind, name));

        let metadata: ModelMetadata = self.format.decode(&read(META_FILE)?)?;
        let normalizer: Normalizer = self.format.decode(&read(NORMALIZER_FILE)?)?;
        let model: M = self.format.decode(&read(MODEL_FILE)?)?;

        validate(modality, kind, &model, &normalizer, &metadata)?;

        Ok(StoredModel {
            model,
            normalizer,
            metadata,
        })
    }
}

fn validate<M: TrainableScorer>(
    modality: Modality,
    kind: ModelKind,
    model: &M,
    normalizer: &Normalizer,
    metadata: &ModelMetadata,
) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::Validation(reason);

    if metadata.modality != modality || metadata.kind != kind {
        return Err(invalid(format!(
            "metadata describes {}/{}",
            metadata.modality, metadata.kind
        )));
    }
    if metadata.model != M::NAME {
        return Err(invalid(format!("expected {} model, found {}", M::NAME, metadata.model)));
    }
    if !metadata.calibration.is_valid_for(kind) {
        return Err(invalid(format!("unusable calibration {:?}", metadata.calibration)));
    }

    normalizer
        .validate()
        .map_err(|e| invalid(format!("normalizer: {}", e)))?;
    model.validate().map_err(|e| invalid(format!("model: {}", e)))?;

    if model.input_dimension() != normalizer.dimension() {
        return Err(invalid(format!(
            "model expects {} features, normalizer has {}",
            model.input_dimension(),
            normalizer.dimension()
        )));
    }

    match kind {
        ModelKind::Density => {
            if normalizer.dimension() != modality.dimension() {
                return Err(invalid(format!(
                    "{} vectors have {} features, artifacts have {}",
                    modality,
                    modality.dimension(),
                    normalizer.dimension()
                )));
            }
        }
        ModelKind::Sequence => {
            if metadata.feature_columns.len() != normalizer.dimension() {
                return Err(invalid(format!(
                    "{} feature columns for {} normalized features",
                    metadata.feature_columns.len(),
                    normalizer.dimension()
                )));
            }
            match metadata.seq_len {
                Some(len) if len >= 2 => {}
                other => return Err(invalid(format!("unusable window length {:?}", other))),
            }
        }
    }

    Ok(())
}
