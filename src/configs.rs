use std::path::PathBuf;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// Where the ordered list of class names comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClassSource {
    /// Names given directly, index i is class id i.
    Inline(Vec<String>),
    /// JSON object `{"0": "name", ...}`, read in file order.
    Json(PathBuf),
}

impl Default for ClassSource {
    fn default() -> Self {
        ClassSource::Inline(vec!["marsh".into(), "dev".into(), "other".into()])
    }
}

/// On-disk layout of the labeled images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceKind {
    /// `*.tfrec` shards of `tf.train.Example` records.
    TfRecord,
    /// `<root>/<class id>/<image file>`
    ImageFolder,
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::TfRecord
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct DataConfig {
    #[derivative(Default(value = "\"data/tamucc/subset_3class/400\".into()"))]
    pub data_path: PathBuf,
    pub source: SourceKind,
    #[derivative(Default(value = "\"tfrec\".into()"))]
    pub extension: String,
    /// Side length of the square rasters.
    #[derivative(Default(value = "400"))]
    pub target_size: usize,
    /// Fraction of the (sorted) shards held out for validation, taken from the front.
    #[derivative(Default(value = "0.4"))]
    pub validation_split: f64,
    #[derivative(Default(value = "16"))]
    pub batch_size: usize,
    /// Number of batches to materialize from each split, `None` reads everything.
    pub num_batches: Option<usize>,
    /// Seed of the record shuffle, `None` keeps file order.
    #[derivative(Default(value = "Some(2048)"))]
    pub shuffle_seed: Option<u64>,
    pub classes: ClassSource,
    /// Loose image files named `<class>_IMG...` used for the per-file evaluation.
    pub sample_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize, PartialEq, Eq)]
#[derivative(Default)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Side length of the average pooling window applied to the raster.
    #[derivative(Default(value = "25"))]
    pub pool: usize,
    #[derivative(Default(value = "128"))]
    pub hidden_dim: usize,
    #[derivative(Default(value = "16"))]
    pub embed_dim: usize,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct AdamConfig {
    #[derivative(Default(value = "1e-4"))]
    pub lr: f32,
    #[derivative(Default(value = "0.9"))]
    pub beta1: f32,
    #[derivative(Default(value = "0.999"))]
    pub beta2: f32,
    #[derivative(Default(value = "1e-7"))]
    pub eps: f32,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TrainConfig {
    pub adam: AdamConfig,
    #[derivative(Default(value = "300"))]
    pub max_epochs: usize,
    #[derivative(Default(value = "10"))]
    pub patience: usize,
    /// Improvements smaller than this do not reset the patience counter.
    #[derivative(Default(value = "0.0"))]
    pub min_delta: f32,
    /// Scale applied to the anchor/positive similarities before the softmax.
    #[derivative(Default(value = "0.2"))]
    pub temperature: f32,
    /// Anchor/positive batches per epoch, `None` derives it from the training set size.
    pub num_batches: Option<usize>,
    #[derivative(Default(value = "42"))]
    pub seed: u64,
    #[derivative(Default(value = "\"results/tamucc_subset_3class_best_weights.bin\".into()"))]
    pub checkpoint_path: PathBuf,
    /// When false the checkpoint is loaded instead of training.
    #[derivative(Default(value = "true"))]
    pub do_train: bool,
    /// Reload the best checkpoint into the model once training stops.
    pub restore_best: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Weights {
    /// Every neighbour counts once.
    Uniform,
    /// Neighbours count by inverse distance.
    Distance,
}

impl Default for Weights {
    fn default() -> Self {
        Weights::Uniform
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct KnnConfig {
    #[derivative(Default(value = "3"))]
    pub k: usize,
    pub weights: Weights,
    /// Leading embedding dimensions used, `None` uses all of them.
    pub dims_used: Option<usize>,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ReportConfig {
    /// Normalized confusion entries below this are shown as zero.
    #[derivative(Default(value = "0.1"))]
    pub thres: f64,
    /// Validation samples evaluated, `None` uses all of them.
    #[derivative(Default(value = "Some(1000)"))]
    pub eval_limit: Option<usize>,
    /// Sample files whose predictions are printed one by one.
    #[derivative(Default(value = "10"))]
    pub print_samples: usize,
    #[derivative(Default(value = "\"results\".into()"))]
    pub results_dir: PathBuf,
    #[derivative(Default(value = "\"tamucc_subset_3class\".into()"))]
    pub run_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Bins {
    Count(usize),
    /// numpy's "auto": the larger of the Sturges and Freedman-Diaconis estimates.
    Auto,
}

impl Default for Bins {
    fn default() -> Self {
        Bins::Auto
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct StatsConfig {
    /// Classes with fewer images are reported as insufficient.
    #[derivative(Default(value = "64"))]
    pub min_per_class: usize,
    pub bins: Bins,
    /// Drop insufficient classes before computing per-class statistics.
    pub filter_insufficient: bool,
    /// Principal components whose cumulative explained variance is reported.
    #[derivative(Default(value = "Some(100)"))]
    pub pca_components: Option<usize>,
    /// Leading training images the principal components are computed on.
    #[derivative(Default(value = "1200"))]
    pub pca_samples: usize,
}

/// Everything one run of the embedding + k-NN pipeline needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataConfig,
    pub embedding: EmbeddingConfig,
    pub train: TrainConfig,
    pub knn: KnnConfig,
    pub report: ReportConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveSpec {
    pub url: String,
    /// File name the archive is saved under in the working directory.
    pub archive: String,
    /// Folder the archive is extracted into.
    pub folder: PathBuf,
    pub remove_archive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub archives: Vec<ArchiveSpec>,
}

const OBJRECOG_RELEASE: &str = "https://github.com/dbuscombe-usgs/mlmondays_data_objrecog/releases/download";

impl Default for DownloadConfig {
    fn default() -> Self {
        let archives = vec![
            ArchiveSpec {
                url: "https://github.com/srihari-humbarwadi/datasets/releases/download/v0.1.0/data.zip".into(),
                archive: "data.zip".into(),
                folder: "./".into(),
                remove_archive: false,
            },
            ArchiveSpec {
                url: format!("{OBJRECOG_RELEASE}/0.1.0/secoora.zip"),
                archive: "secoora.zip".into(),
                folder: "./data".into(),
                remove_archive: true,
            },
            ArchiveSpec {
                url: format!("{OBJRECOG_RELEASE}/0.1.1/secoora_retinanet_scratch_weights.zip"),
                archive: "secoora_retinanet_scratch_weights.zip".into(),
                folder: "./retinanet/scratch".into(),
                remove_archive: true,
            },
            ArchiveSpec {
                url: format!("{OBJRECOG_RELEASE}/0.1.1/secoora_retinanet_coco_finetune_weights.zip"),
                archive: "secoora_retinanet_coco_finetune_weights.zip".into(),
                folder: "./retinanet/finetune".into(),
                remove_archive: true,
            },
        ];
        DownloadConfig { archives }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Configure;

    #[test]
    fn defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.train.patience, 10);
        assert_eq!(c.train.max_epochs, 300);
        assert_eq!(c.embedding.embed_dim, 16);
        assert_eq!(c.data.extension, "tfrec");
        assert!(c.train.do_train);
        assert_eq!(c.stats.pca_components, Some(100));
        assert_eq!(c.stats.pca_samples, 1200);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let mut c = PipelineConfig::default();
        c.load_config("(train: (max_epochs: 5, patience: 2), knn: (k: 1))").unwrap();
        assert_eq!(c.train.max_epochs, 5);
        assert_eq!(c.train.patience, 2);
        assert_eq!(c.train.temperature, 0.2);
        assert_eq!(c.knn.k, 1);
        assert_eq!(c.data.target_size, 400);
    }

    #[test]
    fn shipped_configs_parse() {
        let mut c = PipelineConfig::default();
        c.load_config(include_str!("../assets/configs/tamucc_3class.ron")).unwrap();
        assert_eq!(c.data.classes, ClassSource::Inline(vec!["marsh".into(), "dev".into(), "other".into()]));
        assert_eq!(c.knn.k, 3);

        c.load_config(include_str!("../assets/configs/tamucc_12class.ron")).unwrap();
        assert!(matches!(c.data.classes, ClassSource::Json(_)));
        assert_eq!(c.report.run_name, "tamucc_subset_12class");
        // fields the file leaves out fall back to the defaults
        assert_eq!(c.report.print_samples, 10);
        assert_eq!(c.stats.min_per_class, 64);
    }

    #[test]
    fn download_defaults() {
        let d = DownloadConfig::default();
        assert_eq!(d.archives.len(), 4);
        assert!(!d.archives[0].remove_archive);
        assert!(d.archives[1].url.ends_with("0.1.0/secoora.zip"));
    }
}
