//! Inference records, reference data and model loading.

use super::stats::LogisticRegression;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::instrument;
use uuid::Uuid;

// ============================================================================
// Model Key
// ============================================================================

/// Registered model identity, written `models:/{name}/{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    /// Registered model name.
    pub name: String,
    /// Model version.
    pub version: String,
}

impl ModelKey {
    /// Creates a model key.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Model URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("models:/{}/{}", self.name, self.version)
    }

    /// Column-safe slug: `{name}_{version}`, lowercase, with every run of
    /// non-alphanumeric characters collapsed to `_`.
    #[must_use]
    pub fn slug(&self) -> String {
        let raw = format!("{}_{}", self.name, self.version).to_lowercase();
        raw.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

impl FromStr for ModelKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("models:/")
            .ok_or_else(|| Error::InvalidInput(format!("model URI must start with 'models:/': '{s}'")))?;
        match rest.split('/').collect::<Vec<_>>().as_slice() {
            [name, version, ..] if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(*name, *version))
            },
            _ => Err(Error::InvalidInput(format!(
                "model URI needs a name and a version: '{s}'"
            ))),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One logged inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    /// Inference identifier.
    pub inference_uuid: Uuid,
    /// Registered model name.
    pub model_name: String,
    /// Model version.
    pub model_version: String,
    /// Input feature vector.
    pub features: Vec<f64>,
    /// Predicted probability of the positive class.
    pub prediction: f64,
    /// Time of inference.
    pub created_at: DateTime<Utc>,
    /// User feedback scores, possibly empty.
    #[serde(default)]
    pub feedback: Vec<f64>,
}

impl InferenceRecord {
    /// Creates a record with a fresh UUID and no feedback.
    #[must_use]
    pub fn new(
        model: &ModelKey,
        features: Vec<f64>,
        prediction: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            inference_uuid: Uuid::new_v4(),
            model_name: model.name.clone(),
            model_version: model.version.clone(),
            features,
            prediction,
            created_at,
            feedback: Vec::new(),
        }
    }

    /// Adds feedback scores.
    #[must_use]
    pub fn with_feedback(mut self, feedback: Vec<f64>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Model key of the record.
    #[must_use]
    pub fn model(&self) -> ModelKey {
        ModelKey::new(&self.model_name, &self.model_version)
    }

    /// Calendar date of the record (UTC).
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.created_at.date_naive()
    }

    /// Mean feedback score, if any feedback was collected.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_feedback(&self) -> Option<f64> {
        if self.feedback.is_empty() {
            return None;
        }
        Some(self.feedback.iter().sum::<f64>() / self.feedback.len() as f64)
    }
}

/// Training-time data the live stream is compared against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSet {
    /// Feature vectors.
    pub features: Vec<Vec<f64>>,
    /// Binary labels aligned with `features`.
    pub labels: Vec<bool>,
    /// Positive-class probabilities per model slug.
    #[serde(default)]
    pub predictions: BTreeMap<String, Vec<f64>>,
}

impl ReferenceSet {
    /// Creates a reference set without predictions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if labels and features differ in length.
    pub fn new(features: Vec<Vec<f64>>, labels: Vec<bool>) -> Result<Self> {
        if features.len() != labels.len() {
            return Err(Error::InvalidInput(format!(
                "reference has {} feature rows but {} labels",
                features.len(),
                labels.len()
            )));
        }
        Ok(Self {
            features,
            labels,
            predictions: BTreeMap::new(),
        })
    }

    /// Adds a model's predictions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the predictions do not cover every row.
    pub fn with_predictions(mut self, model: &ModelKey, predictions: Vec<f64>) -> Result<Self> {
        self.set_predictions(model, predictions)?;
        Ok(self)
    }

    /// Stores a model's predictions, replacing earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the predictions do not cover every row.
    pub fn set_predictions(&mut self, model: &ModelKey, predictions: Vec<f64>) -> Result<()> {
        if predictions.len() != self.features.len() {
            return Err(Error::InvalidInput(format!(
                "{} predictions for {} reference rows of {model}",
                predictions.len(),
                self.features.len()
            )));
        }
        self.predictions.insert(model.slug(), predictions);
        Ok(())
    }

    /// Predictions of a model, if present.
    #[must_use]
    pub fn predictions(&self, model: &ModelKey) -> Option<&[f64]> {
        self.predictions.get(&model.slug()).map(Vec::as_slice)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Returns `true` if the set has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

// ============================================================================
// Models
// ============================================================================

/// A binary classifier scoring feature vectors.
pub trait Classifier: Send + Sync {
    /// Positive-class probability for each row.
    ///
    /// # Errors
    ///
    /// Returns an error if a row has the wrong dimension.
    fn predict_proba(&self, features: &[Vec<f64>]) -> Result<Vec<f64>>;
}

/// Resolves a model URI to a classifier.
pub trait ModelLoader: Send + Sync {
    /// Loads the model at `uri`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be found or decoded.
    fn load(&self, uri: &str) -> Result<Arc<dyn Classifier>>;
}

/// Loads logistic models from `{root}/{name}/{version}.json`.
///
/// Each file holds `{"weights": [...], "bias": ...}` over raw features.
#[derive(Debug, Clone)]
pub struct JsonModelLoader {
    root: PathBuf,
}

impl JsonModelLoader {
    /// Creates a loader rooted at a model directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModelLoader for JsonModelLoader {
    fn load(&self, uri: &str) -> Result<Arc<dyn Classifier>> {
        let key: ModelKey = uri.parse()?;
        let path = self
            .root
            .join(&key.name)
            .join(format!("{}.json", key.version));
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::NotFound(format!("model {uri} at {}: {e}", path.display())))?;
        let model: LogisticRegression =
            serde_json::from_str(&contents).map_err(|e| Error::OperationFailed {
                operation: "decode_model".to_string(),
                cause: format!("{uri}: {e}"),
            })?;
        Ok(Arc::new(model))
    }
}

/// Caches loaded models by URI.
pub struct CachedModelLoader {
    inner: Box<dyn ModelLoader>,
    cache: Mutex<LruCache<String, Arc<dyn Classifier>>>,
}

impl CachedModelLoader {
    /// Default number of cached models.
    pub const DEFAULT_CAPACITY: usize = 16;

    /// Wraps a loader with an LRU cache. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(inner: Box<dyn ModelLoader>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl ModelLoader for CachedModelLoader {
    fn load(&self, uri: &str) -> Result<Arc<dyn Classifier>> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("Model cache mutex poisoned, recovering");
                poisoned.into_inner()
            });
            if let Some(model) = cache.get(uri) {
                metrics::counter!("monitoring_model_cache_hits_total").increment(1);
                return Ok(Arc::clone(model));
            }
        }

        metrics::counter!("monitoring_model_cache_misses_total").increment(1);
        let model = self.inner.load(uri)?;
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.put(uri.to_string(), Arc::clone(&model));
        Ok(model)
    }
}

/// Fills missing reference predictions by scoring the reference features.
///
/// Models whose predictions are already present are not loaded. Returns the
/// keys that were scored.
///
/// # Errors
///
/// Returns an error if a model cannot be loaded or scored.
#[instrument(skip(reference, loader), fields(models = models.len()))]
pub fn ensure_predictions(
    reference: &mut ReferenceSet,
    models: &[ModelKey],
    loader: &dyn ModelLoader,
) -> Result<Vec<ModelKey>> {
    let mut scored = Vec::new();
    for model in models {
        if reference.predictions(model).is_some() {
            continue;
        }
        tracing::info!(model = %model, "Scoring reference set");
        let classifier = loader.load(&model.uri())?;
        let predictions = classifier.predict_proba(&reference.features)?;
        reference.set_predictions(model, predictions)?;
        scored.push(model.clone());
    }
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    struct Constant(f64);

    impl Classifier for Constant {
        fn predict_proba(&self, features: &[Vec<f64>]) -> Result<Vec<f64>> {
            Ok(vec![self.0; features.len()])
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, _uri: &str) -> Result<Arc<dyn Classifier>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Constant(0.75)))
        }
    }

    #[test_case("models:/churn/3", "churn", "3" ; "plain")]
    #[test_case("models:/churn/3/extra", "churn", "3" ; "trailing segments")]
    fn test_parse_model_key(uri: &str, name: &str, version: &str) {
        let key: ModelKey = uri.parse().unwrap();
        assert_eq!(key, ModelKey::new(name, version));
    }

    #[test_case("churn/3" ; "missing scheme")]
    #[test_case("models:/churn" ; "missing version")]
    #[test_case("models://3" ; "empty name")]
    fn test_parse_model_key_rejects(uri: &str) {
        assert!(uri.parse::<ModelKey>().is_err());
    }

    #[test]
    fn test_slug() {
        assert_eq!(ModelKey::new("Music Taste", "v1.2").slug(), "music_taste_v1_2");
        assert_eq!(ModelKey::new("churn", "3").uri(), "models:/churn/3");
    }

    #[test]
    fn test_mean_feedback() {
        let record = InferenceRecord::new(&ModelKey::new("m", "1"), vec![], 0.4, Utc::now());
        assert_eq!(record.mean_feedback(), None);
        let record = record.with_feedback(vec![0.0, 1.0, 0.5]);
        assert!((record.mean_feedback().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cached_loader_loads_once() {
        let inner = CountingLoader::default();
        let loads = Arc::clone(&inner.loads);
        let loader = CachedModelLoader::new(Box::new(inner), 2);

        loader.load("models:/m/1").unwrap();
        loader.load("models:/m/1").unwrap();
        loader.load("models:/m/2").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ensure_predictions_skips_present() {
        let present = ModelKey::new("m", "1");
        let missing = ModelKey::new("m", "2");
        let mut reference = ReferenceSet::new(vec![vec![1.0], vec![2.0]], vec![true, false])
            .unwrap()
            .with_predictions(&present, vec![0.1, 0.2])
            .unwrap();

        let scored = ensure_predictions(
            &mut reference,
            &[present.clone(), missing.clone()],
            &CountingLoader::default(),
        )
        .unwrap();
        assert_eq!(scored, vec![missing.clone()]);
        assert_eq!(reference.predictions(&present), Some([0.1, 0.2].as_slice()));
        assert_eq!(reference.predictions(&missing), Some([0.75, 0.75].as_slice()));
    }

    #[test]
    fn test_json_loader() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("churn")).unwrap();
        std::fs::write(
            dir.path().join("churn").join("3.json"),
            r#"{"weights": [2.0], "bias": 0.0}"#,
        )
        .unwrap();

        let loader = JsonModelLoader::new(dir.path());
        let model = loader.load("models:/churn/3").unwrap();
        let p = model.predict_proba(&[vec![0.0], vec![10.0]]).unwrap();
        assert!((p[0] - 0.5).abs() < 1e-9);
        assert!(p[1] > 0.99);
        assert!(matches!(loader.load("models:/churn/4"), Err(Error::NotFound(_))));
    }
}
