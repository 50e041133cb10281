use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::Path;

use image::{ImageOutputFormat, Rgb, RgbImage};

use embed_lib::configs::{ClassSource, PipelineConfig};
use embed_lib::datasets::records::{CLASS_KEY, IMAGE_KEY};
use embed_lib::datasets::tfrecord::{write_record, Example, Feature};
use embed_lib::knn::fit_knn_to_embeddings;
use embed_lib::models::{Embed, EmbeddingModel};
use embed_lib::pipeline;

const SIDE: u32 = 20;

/// Mostly one channel per class, with a little per-image texture.
fn class_image(label: u32, seed: u32, side: u32) -> RgbImage {
    RgbImage::from_fn(side, side, |x, y| {
        let noise = ((x * 7 + y * 3 + seed * 11) % 25) as u8;
        let mut px = [20 + noise, 20 + noise, 20 + noise];
        px[label as usize] = 210 + noise;
        Rgb(px)
    })
}

fn write_shard(path: &Path, samples: &[(u32, u32)]) {
    let mut file = File::create(path).unwrap();
    for &(label, seed) in samples {
        let mut png = Cursor::new(Vec::new());
        class_image(label, seed, SIDE).write_to(&mut png, ImageOutputFormat::Png).unwrap();
        let mut example = Example::default();
        example.features.insert(IMAGE_KEY.into(), Feature::Bytes(vec![png.into_inner()]));
        example.features.insert(CLASS_KEY.into(), Feature::Int64(vec![label as i64]));
        write_record(&mut file, &example.encode()).unwrap();
    }
    file.flush().unwrap();
}

/// Eight shards of six images, two per class. With 3 shards held out for
/// validation, training sees 30 images, 10 per class.
fn setup(root: &Path) -> PipelineConfig {
    let data = root.join("data");
    fs::create_dir_all(&data).unwrap();
    for shard in 0..8u32 {
        let samples: Vec<(u32, u32)> = (0..6).map(|i| (i % 3, shard * 6 + i)).collect();
        write_shard(&data.join(format!("tamucc-{shard:02}.tfrec")), &samples);
    }
    let samples = root.join("sample");
    fs::create_dir_all(&samples).unwrap();
    for (label, name) in ["marsh", "dev", "other"].iter().enumerate() {
        // loose files come at another resolution and get resized
        class_image(label as u32, 99, 32)
            .save(samples.join(format!("{name}_IMG_{label}.png")))
            .unwrap();
    }
    fs::write(samples.join("notes.png"), b"").unwrap();

    let mut config = PipelineConfig::default();
    config.data.data_path = data;
    config.data.target_size = SIDE as usize;
    config.data.batch_size = 6;
    config.data.shuffle_seed = None;
    config.data.classes = ClassSource::Inline(vec!["marsh".into(), "dev".into(), "other".into()]);
    config.data.sample_path = Some(samples);
    config.embedding.pool = 5;
    config.embedding.hidden_dim = 16;
    config.embedding.embed_dim = 4;
    config.train.adam.lr = 1e-3;
    config.train.max_epochs = 5;
    config.train.patience = 2;
    config.train.checkpoint_path = root.join("results/best.bin");
    config.report.results_dir = root.join("results");
    config.report.run_name = "toy".into();
    config.stats.min_per_class = 12;
    config
}

#[test]
fn train_fit_and_evaluate() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    config.train.restore_best = true;

    let summary = pipeline::run(&config, None).unwrap();
    let history = summary.history.as_ref().unwrap();
    assert!(history.epochs() >= 1 && history.epochs() <= 5);
    assert!(config.train.checkpoint_path.exists());

    let score = summary.score.unwrap();
    assert!(score > 1.0 / 3.0, "score {score}");
    let validation = summary.validation.as_ref().unwrap();
    // 3 of 8 shards held out
    assert_eq!(validation.total(), 18);
    assert_eq!(validation.row_sums(), vec![6, 6, 6]);
    let (confident, cm) = summary.confident.as_ref().unwrap();
    assert_eq!(cm.total() as usize, *confident);

    // notes.png carries no class and is skipped
    assert_eq!(summary.samples.as_ref().unwrap().total(), 3);

    let results = dir.path().join("results");
    for name in ["toy_history.csv", "toy_score.txt", "toy_cm_val.csv", "toy_cm_val_v2.csv", "toy_cm_samples.csv"] {
        assert!(results.join(name).exists(), "{name} missing");
    }
    let csv = fs::read_to_string(results.join("toy_history.csv")).unwrap();
    assert_eq!(csv.lines().count(), history.epochs() + 1);

    // the restored best model separates the training set
    let model = EmbeddingModel::load(&config.train.checkpoint_path).unwrap();
    let train = pipeline::load_splits(&config.data).unwrap().train;
    assert_eq!(train.len(), 30);
    let knn = fit_knn_to_embeddings(&model, train.images.view(), &train.labels, &config.knn).unwrap();
    let embeddings = model.embed_normalized(train.images.view()).unwrap();
    let train_score = knn.score(embeddings.view(), &train.labels).unwrap();
    assert!(train_score > 1.0 / 3.0, "training score {train_score}");
}

#[test]
fn reload_instead_of_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    config.train.max_epochs = 2;
    pipeline::run(&config, None).unwrap();

    config.train.do_train = false;
    let summary = pipeline::run(&config, None).unwrap();
    assert!(summary.history.is_none());
    assert!(summary.score.is_some());

    config.embedding.embed_dim = 8;
    assert!(pipeline::run(&config, None).is_err());
}

#[test]
fn dataset_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let stats = pipeline::run_stats(&config).unwrap();
    assert_eq!(stats.counts, vec![10, 10, 10]);
    assert_eq!(stats.insufficient, vec![0, 1, 2]);
    assert_eq!(stats.classes.len(), 3);
    // 100 components clamped to the 30 training images span all of them
    let (components, ratio) = stats.explained_variance.unwrap();
    assert_eq!(components, 30);
    assert!(ratio > 0.999, "explained variance {ratio}");
    let results = dir.path().join("results");
    let report = fs::read_to_string(results.join("toy_stats.txt")).unwrap();
    assert!(report.contains("Cumulative variance explained by 30 principal components: "));
    assert!(results.join("toy_mean_marsh.png").exists());
    assert!(results.join("toy_median_other.png").exists());
}
