//! The end to end runs driven by the command line: dataset statistics, and
//! train (or reload) -> fit k-NN -> evaluate.
use crossbeam::channel::Sender;
use tracing::{info, warn};

use crate::configs::{DataConfig, PipelineConfig, SourceKind};
use crate::datasets::folder::{list_images, FolderParams};
use crate::datasets::stats::{to_rgb_image, DatasetStats};
use crate::datasets::{take_batches, ClassNames, Dataset, DatasetBuilder, LabeledImages, ShardParams};
use crate::evaluation::confusion::{render, ConfusionMatrix};
use crate::evaluation::{conf_mat_filesamples, high_confidence, predict_files, sample_line, ReportWriter};
use crate::knn::{fit_knn_to_embeddings, KnnClassifier};
use crate::models::{fit_or_load, Embed, EmbeddingModel, History, TrainRecv};
use crate::Result;

const SAMPLE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Both splits, fully materialized.
pub struct Splits {
    pub train: LabeledImages,
    pub validation: Option<LabeledImages>,
}

fn materialize<B: DatasetBuilder>(builder: &B, num_batches: Option<usize>) -> Result<Splits>
where
    B::Dataset: Dataset<DataPoint = LabeledImages>,
{
    let mut train = builder.build_train()?;
    let train = take_batches(&mut train, num_batches)?;
    let validation = match builder.build_test() {
        Some(ds) => Some(take_batches(&mut ds?, num_batches)?),
        None => None,
    };
    Ok(Splits { train, validation })
}

pub fn load_splits(config: &DataConfig) -> Result<Splits> {
    let splits = match config.source {
        SourceKind::TfRecord => materialize(&ShardParams::from_config(config)?, config.num_batches)?,
        SourceKind::ImageFolder => {
            let params = FolderParams {
                path: config.data_path.clone(),
                target_size: config.target_size,
                batch_size: config.batch_size,
                shuffle_seed: config.shuffle_seed,
            };
            materialize(&params, config.num_batches)?
        }
    };
    info!(
        "{} training and {} validation images",
        splits.train.len(),
        splits.validation.as_ref().map_or(0, |v| v.len())
    );
    Ok(splits)
}

/// Pairs drawn per epoch when not configured: one per batch of the training set.
pub fn default_num_batches(train_len: usize, batch_size: usize) -> usize {
    (train_len / batch_size.max(1)).max(1)
}

/// Counts, insufficient classes, mean and median images and channel histograms
/// of the training split.
pub fn run_stats(config: &PipelineConfig) -> Result<DatasetStats> {
    let names = ClassNames::load(&config.data.classes)?;
    let splits = load_splits(&config.data)?;
    let stats = DatasetStats::compute(&splits.train, &names, &config.stats)?;
    let report = stats.report();
    print!("{report}");

    let writer = ReportWriter::new(&config.report.results_dir, &config.report.run_name)?;
    writer.write("stats.txt", &report)?;
    for class in &stats.classes {
        for (kind, img) in [("mean", &class.mean), ("median", &class.median)] {
            let path = writer.path(&format!("{kind}_{}.png", class.name));
            to_rgb_image(img.view()).save(&path)?;
        }
    }
    Ok(stats)
}

/// What one run measured.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub history: Option<History>,
    pub score: Option<f64>,
    pub validation: Option<ConfusionMatrix>,
    /// Number of validation rows with a unanimous vote and their matrix.
    pub confident: Option<(usize, ConfusionMatrix)>,
    pub samples: Option<ConfusionMatrix>,
}

fn evaluate_validation(
    config: &PipelineConfig,
    model: &EmbeddingModel,
    knn: &KnnClassifier,
    names: &ClassNames,
    mut data: LabeledImages,
    writer: &ReportWriter,
    summary: &mut RunSummary,
) -> Result<()> {
    if let Some(limit) = config.report.eval_limit {
        data.truncate(limit);
    }
    let num_classes = names.len().max(knn.num_classes());
    let embeddings = model.embed_normalized(data.images.view())?;

    let score = knn.score(embeddings.view(), &data.labels)?;
    println!("KNN score: {:.6}", score);
    writer.write("score.txt", &format!("KNN score: {:.6}\n", score))?;
    summary.score = Some(score);

    let pred = knn.predict(embeddings.view())?;
    let cm = ConfusionMatrix::from_predictions(&data.labels, &pred, num_classes)?;
    let shown = cm.thresholded(config.report.thres);
    print!("{}", render(&shown, names));
    writer.write_matrix("cm_val.csv", &shown, names)?;
    summary.validation = Some(cm);

    let proba = knn.predict_proba(embeddings.view())?;
    let (rows, confident_pred) = high_confidence(&proba);
    println!("{}", rows.len());
    let truth: Vec<u32> = rows.iter().map(|&i| data.labels[i]).collect();
    let cm = ConfusionMatrix::from_predictions(&truth, &confident_pred, num_classes)?;
    let shown = cm.thresholded(config.report.thres);
    print!("{}", render(&shown, names));
    writer.write_matrix("cm_val_v2.csv", &shown, names)?;
    summary.confident = Some((rows.len(), cm));
    Ok(())
}

/// Loads the data, trains or reloads the model, fits the classifier and
/// reports on the validation split and the loose sample files.
pub fn run(config: &PipelineConfig, sender: Option<Sender<TrainRecv>>) -> Result<RunSummary> {
    let names = ClassNames::load(&config.data.classes)?;
    let Splits { train, validation } = load_splits(&config.data)?;
    let num_batches = config
        .train
        .num_batches
        .unwrap_or_else(|| default_num_batches(train.len(), config.data.batch_size));

    let (model, history) = fit_or_load(&config.train, &config.embedding, &train, num_batches, sender)?;
    let writer = ReportWriter::new(&config.report.results_dir, &config.report.run_name)?;
    if let Some(history) = &history {
        writer.write("history.csv", &history.to_csv())?;
    }
    let mut summary = RunSummary {
        history,
        ..Default::default()
    };

    let knn = fit_knn_to_embeddings(&model, train.images.view(), &train.labels, &config.knn)?;
    drop(train);

    match validation {
        Some(data) if !data.is_empty() => {
            evaluate_validation(config, &model, &knn, &names, data, &writer, &mut summary)?
        }
        _ => warn!("no validation images, skipping the validation report"),
    }

    if let Some(dir) = &config.data.sample_path {
        let files = list_images(dir, &SAMPLE_EXTENSIONS)?;
        let predictions = predict_files(&model, &knn, &files, config.data.target_size)?;
        for p in predictions.iter().take(config.report.print_samples) {
            println!("{}", sample_line(p, &names));
        }
        let cm = conf_mat_filesamples(&predictions, &names, names.len().max(knn.num_classes()))?;
        let shown = cm.thresholded(config.report.thres);
        print!("{}", render(&shown, &names));
        writer.write_matrix("cm_samples.csv", &shown, &names)?;
        summary.samples = Some(cm);
    }
    Ok(summary)
}
