//! Pre-trained scaler and K-Means artifacts, and cluster assignment

use crate::config::PipelineConfig;
use crate::data::{ClusterLabel, RfmVector};
use crate::error::{ArtifactError, PipelineError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Number of RFM features every artifact must be fitted on
pub const N_FEATURES: usize = 3;

/// Fitted feature scaler, applied with its training-time parameters only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scaler {
    /// `(x - mean) / scale`
    Standard {
        mean: [f64; N_FEATURES],
        scale: [f64; N_FEATURES],
    },
    /// Yeo-Johnson power transform followed by standardisation
    YeoJohnson {
        lambdas: [f64; N_FEATURES],
        mean: [f64; N_FEATURES],
        scale: [f64; N_FEATURES],
    },
}

impl Scaler {
    fn validate(&self) -> std::result::Result<(), String> {
        let (mean, scale, lambdas) = match self {
            Scaler::Standard { mean, scale } => (mean, scale, None),
            Scaler::YeoJohnson {
                lambdas,
                mean,
                scale,
            } => (mean, scale, Some(lambdas)),
        };

        let mut params = mean.iter().chain(scale.iter()).chain(lambdas.into_iter().flatten());
        if params.any(|v| !v.is_finite()) {
            return Err("scaler parameters must be finite".to_string());
        }
        if scale.iter().any(|&s| s <= 0.0) {
            return Err("scaler scale must be positive".to_string());
        }
        Ok(())
    }

    /// Scale an `(n, 3)` feature matrix
    pub fn transform(&self, features: &Array2<f64>) -> Array2<f64> {
        let mut scaled = features.to_owned();
        for (j, mut column) in scaled.axis_iter_mut(Axis(1)).enumerate() {
            match self {
                Scaler::Standard { mean, scale } => {
                    column.mapv_inplace(|x| (x - mean[j]) / scale[j]);
                }
                Scaler::YeoJohnson {
                    lambdas,
                    mean,
                    scale,
                } => {
                    column.mapv_inplace(|x| (yeo_johnson(x, lambdas[j]) - mean[j]) / scale[j]);
                }
            }
        }
        scaled
    }
}

/// Yeo-Johnson transform of one value
pub fn yeo_johnson(x: f64, lambda: f64) -> f64 {
    if x >= 0.0 {
        if lambda.abs() < f64::EPSILON {
            x.ln_1p()
        } else {
            ((x + 1.0).powf(lambda) - 1.0) / lambda
        }
    } else if (lambda - 2.0).abs() > f64::EPSILON {
        -((1.0 - x).powf(2.0 - lambda) - 1.0) / (2.0 - lambda)
    } else {
        -(-x).ln_1p()
    }
}

/// Serialized form of the cluster model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ModelArtifact {
    KMeans { centroids: Vec<[f64; N_FEATURES]> },
}

/// Fitted K-Means model: centroids in scaled feature space
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansModel {
    centroids: Array2<f64>,
}

impl KMeansModel {
    pub fn from_centroids(centroids: &[[f64; N_FEATURES]]) -> std::result::Result<Self, String> {
        if centroids.is_empty() {
            return Err("model has no centroids".to_string());
        }
        if centroids.iter().flatten().any(|v| !v.is_finite()) {
            return Err("centroids must be finite".to_string());
        }

        let centroids = Array2::from_shape_fn((centroids.len(), N_FEATURES), |(i, j)| {
            centroids[i][j]
        });
        Ok(Self { centroids })
    }

    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }

    /// Nearest centroid for each scaled row; ties go to the lowest index
    pub fn predict(&self, scaled: &Array2<f64>) -> Vec<ClusterLabel> {
        scaled
            .outer_iter()
            .map(|row| self.nearest(&row))
            .collect()
    }

    fn nearest(&self, features: &ArrayView1<f64>) -> ClusterLabel {
        let mut min_distance = f64::INFINITY;
        let mut closest_cluster = 0;

        for (cluster_idx, centroid) in self.centroids.outer_iter().enumerate() {
            let distance: f64 = features
                .iter()
                .zip(centroid.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();

            if distance < min_distance {
                min_distance = distance;
                closest_cluster = cluster_idx;
            }
        }

        ClusterLabel(closest_cluster as u32)
    }
}

/// Count labels per cluster index
pub fn cluster_sizes(labels: &[ClusterLabel], n_clusters: usize) -> Vec<usize> {
    let mut sizes = vec![0; n_clusters];
    for label in labels {
        if let Some(size) = sizes.get_mut(label.0 as usize) {
            *size += 1;
        }
    }
    sizes
}

/// Scale then predict a batch of raw RFM vectors
///
/// Output has the same length and order as `vectors`. A missing scaler or
/// model is reported as unavailable rather than defaulted.
pub fn assign(
    scaler: Option<&Scaler>,
    model: Option<&KMeansModel>,
    vectors: &[RfmVector],
) -> Result<Vec<ClusterLabel>> {
    let scaler = scaler.ok_or(ArtifactError::Missing("scaler"))?;
    let model = model.ok_or(ArtifactError::Missing("model"))?;

    if let Some(bad) = vectors
        .iter()
        .find(|v| v.to_array().iter().any(|x| !x.is_finite()))
    {
        return Err(PipelineError::InvalidInput(format!(
            "RFM vector must be finite: {:?}",
            bad
        )));
    }

    let features = Array2::from_shape_fn((vectors.len(), N_FEATURES), |(i, j)| {
        vectors[i].to_array()[j]
    });
    let scaled = scaler.transform(&features);
    Ok(model.predict(&scaled))
}

/// Single-vector assignment, a batch of one
pub fn assign_one(
    scaler: Option<&Scaler>,
    model: Option<&KMeansModel>,
    vector: RfmVector,
) -> Result<ClusterLabel> {
    assign(scaler, model, std::slice::from_ref(&vector))?
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::InvalidInput("empty assignment batch".to_string()))
}

/// Load-by-name access to serialized artifacts
pub trait ArtifactStore {
    /// Raw artifact bytes, or `None` when nothing is stored under `name`
    fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Artifacts stored as `<dir>/<name>.json`
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for DirArtifactStore {
    fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(format!("{}.json", name));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ArtifactStore for HashMap<String, Vec<u8>> {
    fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(name).cloned())
    }
}

/// Names under which the scaler and model are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub scaler: String,
    pub model: String,
}

impl ArtifactNames {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            scaler: config.scaler_name.clone(),
            model: config.model_name.clone(),
        }
    }
}

/// A scaler and the model fitted on its output
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPair {
    pub scaler: Scaler,
    pub model: KMeansModel,
}

fn fetch_bytes(store: &dyn ArtifactStore, name: &str) -> std::result::Result<Vec<u8>, ArtifactError> {
    store
        .fetch(name)
        .map_err(|e| ArtifactError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ArtifactError::NotFound(name.to_string()))
}

/// Load and validate both artifacts
pub fn load_artifacts(
    store: &dyn ArtifactStore,
    names: &ArtifactNames,
) -> std::result::Result<ArtifactPair, ArtifactError> {
    let corrupt = |name: &str, reason: String| ArtifactError::Corrupt {
        name: name.to_string(),
        reason,
    };

    let scaler: Scaler = serde_json::from_slice(&fetch_bytes(store, &names.scaler)?)
        .map_err(|e| corrupt(&names.scaler, e.to_string()))?;
    scaler
        .validate()
        .map_err(|reason| corrupt(&names.scaler, reason))?;

    let artifact: ModelArtifact = serde_json::from_slice(&fetch_bytes(store, &names.model)?)
        .map_err(|e| corrupt(&names.model, e.to_string()))?;
    let model = match artifact {
        ModelArtifact::KMeans { centroids } => KMeansModel::from_centroids(&centroids)
            .map_err(|reason| corrupt(&names.model, reason))?,
    };

    Ok(ArtifactPair { scaler, model })
}

#[derive(Debug, Clone)]
enum Availability {
    Ready(Arc<ArtifactPair>),
    Unavailable(ArtifactError),
}

/// Process-lifetime handle to the current scaler/model pair
///
/// Loaded once; an unavailable artifact stays unavailable until an explicit
/// `reload`. Every assignment reads one pair, so a concurrent reload is never
/// observed half-applied.
#[derive(Debug)]
pub struct ModelHandle {
    names: ArtifactNames,
    state: RwLock<Availability>,
}

impl ModelHandle {
    /// Load the named artifacts, caching an unavailable state on failure
    pub fn load(store: &dyn ArtifactStore, names: ArtifactNames) -> Self {
        let state = match load_artifacts(store, &names) {
            Ok(pair) => {
                info!(
                    "Loaded scaler '{}' and model '{}' ({} clusters)",
                    names.scaler,
                    names.model,
                    pair.model.n_clusters()
                );
                Availability::Ready(Arc::new(pair))
            }
            Err(e) => {
                warn!("Cluster model unavailable: {}", e);
                Availability::Unavailable(e)
            }
        };

        Self {
            names,
            state: RwLock::new(state),
        }
    }

    pub fn from_pair(names: ArtifactNames, pair: ArtifactPair) -> Self {
        Self {
            names,
            state: RwLock::new(Availability::Ready(Arc::new(pair))),
        }
    }

    /// The pair currently in use
    pub fn current(&self) -> Result<Arc<ArtifactPair>> {
        let state = self.state.read().map_err(|_| PipelineError::LockPoisoned)?;
        match &*state {
            Availability::Ready(pair) => Ok(Arc::clone(pair)),
            Availability::Unavailable(reason) => {
                Err(PipelineError::ModelUnavailable(reason.clone()))
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.current().is_ok()
    }

    pub fn n_clusters(&self) -> Result<usize> {
        Ok(self.current()?.model.n_clusters())
    }

    pub fn assign(&self, vectors: &[RfmVector]) -> Result<Vec<ClusterLabel>> {
        let pair = self.current()?;
        assign(Some(&pair.scaler), Some(&pair.model), vectors)
    }

    pub fn assign_one(&self, vector: RfmVector) -> Result<ClusterLabel> {
        let pair = self.current()?;
        assign_one(Some(&pair.scaler), Some(&pair.model), vector)
    }

    /// Replace the pair with freshly loaded artifacts
    ///
    /// Both artifacts are loaded before the swap. On failure the previous
    /// pair stays in place.
    pub fn reload(&self, store: &dyn ArtifactStore) -> Result<()> {
        let pair = load_artifacts(store, &self.names)?;
        let n_clusters = pair.model.n_clusters();

        let mut state = self.state.write().map_err(|_| PipelineError::LockPoisoned)?;
        *state = Availability::Ready(Arc::new(pair));
        drop(state);

        info!("Reloaded cluster model ({} clusters)", n_clusters);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity_scaler() -> Scaler {
        Scaler::Standard {
            mean: [0.0; 3],
            scale: [1.0; 3],
        }
    }

    fn four_cluster_pair() -> ArtifactPair {
        ArtifactPair {
            scaler: Scaler::Standard {
                mean: [90.0, 5.0, 2000.0],
                scale: [100.0, 8.0, 5000.0],
            },
            model: KMeansModel::from_centroids(&[
                [1.5, -0.5, -0.4],
                [0.6, -0.3, -0.2],
                [-0.8, -0.4, -0.3],
                [-0.8, 2.0, 1.8],
            ])
            .unwrap(),
        }
    }

    fn names() -> ArtifactNames {
        ArtifactNames {
            scaler: "scaler".to_string(),
            model: "model".to_string(),
        }
    }

    fn artifact_map(scaler: &str, model: &str) -> HashMap<String, Vec<u8>> {
        let mut map = HashMap::new();
        map.insert("scaler".to_string(), scaler.as_bytes().to_vec());
        map.insert("model".to_string(), model.as_bytes().to_vec());
        map
    }

    #[test]
    fn test_standard_scaler_transform() {
        let scaler = Scaler::Standard {
            mean: [10.0, 2.0, 100.0],
            scale: [5.0, 1.0, 50.0],
        };
        let input = Array2::from_shape_vec((1, 3), vec![20.0, 4.0, 50.0]).unwrap();
        let scaled = scaler.transform(&input);
        assert_eq!(scaled.row(0).to_vec(), vec![2.0, 2.0, -1.0]);
    }

    #[test]
    fn test_yeo_johnson_known_values() {
        // lambda 1 is the identity on both sides of zero
        assert!((yeo_johnson(3.0, 1.0) - 3.0).abs() < 1e-12);
        assert!((yeo_johnson(-3.0, 1.0) + 3.0).abs() < 1e-12);
        // lambda 0 is log1p for non-negative input
        assert!((yeo_johnson(std::f64::consts::E - 1.0, 0.0) - 1.0).abs() < 1e-12);
        // lambda 2 is -log1p(-x) for negative input
        assert!((yeo_johnson(-(std::f64::consts::E - 1.0), 2.0) + 1.0).abs() < 1e-12);
        assert!((yeo_johnson(3.0, 0.5) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_predict_nearest_centroid() {
        let model = KMeansModel::from_centroids(&[[0.0; 3], [10.0; 3]]).unwrap();
        let labels = assign(
            Some(&identity_scaler()),
            Some(&model),
            &[RfmVector::new(9.0, 9.0, 9.0), RfmVector::new(1.0, 0.0, 2.0)],
        )
        .unwrap();
        assert_eq!(labels, vec![ClusterLabel(1), ClusterLabel(0)]);
    }

    #[test]
    fn test_tie_resolves_to_lowest_index() {
        let model = KMeansModel::from_centroids(&[[0.0; 3], [2.0; 3]]).unwrap();
        let label = assign_one(Some(&identity_scaler()), Some(&model), RfmVector::new(1.0, 1.0, 1.0))
            .unwrap();
        assert_eq!(label, ClusterLabel(0));
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let scaler = identity_scaler();
        let result = assign(Some(&scaler), None, &[RfmVector::new(1.0, 1.0, 1.0)]);
        assert!(matches!(
            result,
            Err(PipelineError::ModelUnavailable(ArtifactError::Missing("model")))
        ));

        let result = assign_one(None, None, RfmVector::new(1.0, 1.0, 1.0));
        assert!(matches!(result, Err(PipelineError::ModelUnavailable(_))));
    }

    #[test]
    fn test_non_finite_vector_rejected() {
        let pair = four_cluster_pair();
        let result = assign(
            Some(&pair.scaler),
            Some(&pair.model),
            &[RfmVector::new(f64::NAN, 1.0, 1.0)],
        );
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn test_empty_batch() {
        let pair = four_cluster_pair();
        let labels = assign(Some(&pair.scaler), Some(&pair.model), &[]).unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn test_cluster_sizes() {
        let labels = [ClusterLabel(0), ClusterLabel(2), ClusterLabel(2), ClusterLabel(7)];
        assert_eq!(cluster_sizes(&labels, 3), vec![1, 0, 2]);
    }

    #[test]
    fn test_load_artifacts_from_json() {
        let store = artifact_map(
            r#"{"kind":"yeo_johnson","lambdas":[0.2,-0.9,0.1],"mean":[3.5,0.6,7.1],"scale":[1.4,0.2,1.3]}"#,
            r#"{"kind":"k_means","centroids":[[0,0,0],[1,1,1]]}"#,
        );
        let pair = load_artifacts(&store, &names()).unwrap();
        assert_eq!(pair.model.n_clusters(), 2);
        assert!(matches!(pair.scaler, Scaler::YeoJohnson { .. }));
    }

    #[test]
    fn test_load_artifacts_reports_not_found_and_corrupt() {
        let mut store = artifact_map(
            r#"{"kind":"standard","mean":[0,0,0],"scale":[1,1,1]}"#,
            r#"{"kind":"k_means","centroids":[]}"#,
        );
        assert!(matches!(
            load_artifacts(&store, &names()),
            Err(ArtifactError::Corrupt { .. })
        ));

        store.insert(
            "scaler".to_string(),
            br#"{"kind":"standard","mean":[0,0,0],"scale":[1,0,1]}"#.to_vec(),
        );
        assert!(matches!(
            load_artifacts(&store, &names()),
            Err(ArtifactError::Corrupt { .. })
        ));

        store.remove("scaler");
        assert_eq!(
            load_artifacts(&store, &names()),
            Err(ArtifactError::NotFound("scaler".to_string()))
        );
    }

    #[test]
    fn test_dir_artifact_store() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("scaler.json"), b"{}").unwrap();
        let store = DirArtifactStore::new(dir.path());

        assert_eq!(store.fetch("scaler").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.fetch("model").unwrap(), None);
    }

    #[test]
    fn test_handle_caches_unavailable_state() {
        let store: HashMap<String, Vec<u8>> = HashMap::new();
        let handle = ModelHandle::load(&store, names());

        assert!(!handle.is_available());
        assert!(matches!(
            handle.assign_one(RfmVector::new(1.0, 1.0, 1.0)),
            Err(PipelineError::ModelUnavailable(ArtifactError::NotFound(_)))
        ));
    }

    #[test]
    fn test_reload_swaps_pair_and_keeps_old_on_failure() {
        let v = RfmVector::new(100.0, 100.0, 100.0);
        let first = artifact_map(
            r#"{"kind":"standard","mean":[0,0,0],"scale":[1,1,1]}"#,
            r#"{"kind":"k_means","centroids":[[0,0,0],[100,100,100]]}"#,
        );
        let handle = ModelHandle::load(&first, names());
        assert_eq!(handle.assign_one(v).unwrap(), ClusterLabel(1));

        let second = artifact_map(
            r#"{"kind":"standard","mean":[0,0,0],"scale":[1,1,1]}"#,
            r#"{"kind":"k_means","centroids":[[100,100,100],[0,0,0]]}"#,
        );
        handle.reload(&second).unwrap();
        assert_eq!(handle.assign_one(v).unwrap(), ClusterLabel(0));

        let broken: HashMap<String, Vec<u8>> = HashMap::new();
        assert!(handle.reload(&broken).is_err());
        assert_eq!(handle.assign_one(v).unwrap(), ClusterLabel(0));
    }

    #[test]
    fn test_concurrent_reload_never_mixes_pairs() {
        // Both pairs put `v` in cluster 1; either mixed combination puts it in cluster 0
        let a = artifact_map(
            r#"{"kind":"standard","mean":[0,0,0],"scale":[1,1,1]}"#,
            r#"{"kind":"k_means","centroids":[[0,0,0],[100,100,100]]}"#,
        );
        let b = artifact_map(
            r#"{"kind":"standard","mean":[0,0,0],"scale":[100,100,100]}"#,
            r#"{"kind":"k_means","centroids":[[50,50,50],[1,1,1]]}"#,
        );
        let v = RfmVector::new(100.0, 100.0, 100.0);
        let handle = ModelHandle::load(&a, names());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..50 {
                    let store = if i % 2 == 0 { &b } else { &a };
                    handle.reload(store).unwrap();
                }
            });
            for _ in 0..200 {
                assert_eq!(handle.assign_one(v).unwrap(), ClusterLabel(1));
            }
        });
    }

    proptest! {
        #[test]
        fn assignment_is_deterministic_and_batch_matches_single(
            rows in prop::collection::vec((0.0_f64..400.0, 1.0_f64..200.0, 0.0_f64..50_000.0), 1..20)
        ) {
            let pair = four_cluster_pair();
            let vectors: Vec<RfmVector> = rows
                .iter()
                .map(|&(r, f, m)| RfmVector::new(r, f, m))
                .collect();

            let first = assign(Some(&pair.scaler), Some(&pair.model), &vectors).unwrap();
            let second = assign(Some(&pair.scaler), Some(&pair.model), &vectors).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), vectors.len());

            for (vector, label) in vectors.iter().zip(&first) {
                let single = assign_one(Some(&pair.scaler), Some(&pair.model), *vector).unwrap();
                prop_assert_eq!(single, *label);
                prop_assert!(label.0 < 4);
            }
        }
    }
}
