use std::fmt::Write;
use std::path::{Path, PathBuf};

use crossbeam::channel::Sender;
use ndarray::prelude::*;
use tracing::{debug, info, warn};

use super::loss::pair_loss;
use super::EmbeddingModel;
use crate::configs::{EmbeddingConfig, TrainConfig};
use crate::datasets::{AnchorPositivePairs, LabeledImages, PairBatch};
use crate::nn::Adam;
use crate::{Error, Result};

/// Progress events published while training.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainRecv {
    PLOT(String, f32, f32), // key, x, y
    CHECKPOINT(f32, PathBuf),
    FAILED(String),
}

/// Per epoch means of the loss and the pair accuracy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub loss: Vec<f32>,
    pub accuracy: Vec<f32>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("epoch,loss,accuracy\n");
        for (i, (l, a)) in self.loss.iter().zip(&self.accuracy).enumerate() {
            let _ = writeln!(out, "{},{},{}", i + 1, l, a);
        }
        out
    }
}

/// Stops once the monitored loss failed to improve by more than `min_delta`
/// for `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best: f32,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        EarlyStopping {
            patience,
            min_delta: min_delta.abs(),
            best: f32::INFINITY,
            wait: 0,
        }
    }

    /// Records the loss of an epoch, true once training should stop.
    pub fn update(&mut self, loss: f32) -> bool {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}

/// Writes the model whenever the loss reaches a new minimum.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    best: f32,
    best_epoch: Option<usize>,
}

impl ModelCheckpoint {
    pub fn new(path: &Path) -> Self {
        ModelCheckpoint {
            path: path.to_path_buf(),
            best: f32::INFINITY,
            best_epoch: None,
        }
    }

    /// Saves `model` if `loss` is the best so far, returning whether it did.
    pub fn update(&mut self, epoch: usize, loss: f32, model: &EmbeddingModel) -> Result<bool> {
        if loss >= self.best {
            return Ok(false);
        }
        model.save(&self.path)?;
        self.best = loss;
        self.best_epoch = Some(epoch);
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

fn check_finite(epoch: usize, loss: f32) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(Error::Divergence { epoch, loss })
    }
}

/// Forward and backward pass over one batch followed by an optimizer step.
/// Returns the loss and pair accuracy, the weights are left untouched when the
/// loss is not finite.
pub fn train_step(
    model: &mut EmbeddingModel,
    adam: &mut Adam,
    batch: &PairBatch,
    temperature: f32,
) -> Result<(f32, f32)> {
    let n = batch.num_classes();
    let stacked = ndarray::concatenate(Axis(0), &[batch.anchors.view(), batch.positives.view()])?;
    let x = model.features(stacked.view())?;
    let (emb, back) = model.forward(&x);
    let anchors = emb.slice(s![..n, ..]).to_owned();
    let positives = emb.slice(s![n.., ..]).to_owned();
    let (loss, accuracy, dloss) = pair_loss(&anchors, &positives, temperature);
    if !loss.is_finite() {
        return Ok((loss, accuracy));
    }
    let (da, dp) = dloss(1.0);
    let demb = ndarray::concatenate(Axis(0), &[da.view(), dp.view()])?;
    back(&mut *model, &demb);
    model.update(adam);
    Ok((loss, accuracy))
}

pub struct Trainer<'a> {
    config: &'a TrainConfig,
    sender: Option<Sender<TrainRecv>>,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a TrainConfig) -> Self {
        Trainer { config, sender: None }
    }

    /// Publishes progress on `sender` as well as through the log.
    pub fn with_sender(mut self, sender: Sender<TrainRecv>) -> Self {
        self.sender = Some(sender);
        self
    }

    fn send(&self, msg: TrainRecv) {
        if let Some(sender) = &self.sender {
            // nobody listening is fine
            let _ = sender.send(msg);
        }
    }

    /// Trains on anchor/positive pairs of `data`, `num_batches` pairs per epoch.
    pub fn fit(&self, model: &mut EmbeddingModel, data: &LabeledImages, num_batches: usize) -> Result<History> {
        let config = self.config;
        if num_batches == 0 {
            return Err(Error::invalid("num_batches", 0, "an epoch needs at least one batch"));
        }
        if config.temperature <= 0.0 {
            return Err(Error::invalid("temperature", config.temperature, "must be positive"));
        }
        let mut sampler = AnchorPositivePairs::from_data(data, num_batches, config.seed)?;
        let mut adam = Adam::new(&config.adam);
        let mut early_stopping = EarlyStopping::new(config.patience, config.min_delta);
        let mut checkpoint = ModelCheckpoint::new(&config.checkpoint_path);
        let mut history = History::default();
        info!(
            "training on {} images of {} classes, {} batches per epoch",
            data.len(),
            sampler.index().num_classes(),
            num_batches
        );

        for epoch in 1..=config.max_epochs {
            sampler.restart();
            let (mut loss_sum, mut acc_sum) = (0.0, 0.0);
            for (step, batch) in sampler.by_ref().enumerate() {
                let (loss, acc) = train_step(model, &mut adam, &batch, config.temperature)?;
                if let Err(e) = check_finite(epoch, loss) {
                    self.send(TrainRecv::FAILED(e.to_string()));
                    return Err(e);
                }
                debug!("epoch {epoch} step {step}: loss {loss:.4}");
                loss_sum += loss;
                acc_sum += acc;
            }
            let loss = loss_sum / num_batches as f32;
            let accuracy = acc_sum / num_batches as f32;
            history.loss.push(loss);
            history.accuracy.push(accuracy);
            info!("epoch {epoch}/{}: loss {loss:.4}, accuracy {accuracy:.3}", config.max_epochs);
            self.send(TrainRecv::PLOT("loss".to_string(), epoch as f32, loss));
            self.send(TrainRecv::PLOT("accuracy".to_string(), epoch as f32, accuracy));

            match checkpoint.update(epoch, loss, model) {
                Ok(true) => {
                    info!("loss improved to {loss:.4}, saved {}", checkpoint.path().display());
                    self.send(TrainRecv::CHECKPOINT(epoch as f32, checkpoint.path().to_path_buf()));
                }
                Ok(false) => {}
                Err(e) => {
                    self.send(TrainRecv::FAILED(format!("failed to write checkpoint, {}", e)));
                    return Err(e);
                }
            }

            if early_stopping.update(loss) {
                info!("no improvement for {} epochs, stopping at epoch {epoch}", config.patience);
                history.stopped_early = true;
                break;
            }
        }
        history.best_epoch = checkpoint.best_epoch();

        if config.restore_best && checkpoint.best_epoch().is_some() {
            *model = EmbeddingModel::load(checkpoint.path())?;
        }
        Ok(history)
    }
}

/// Trains a fresh model when `do_train` is set, otherwise reloads the
/// checkpoint, which has to match `model_config`.
pub fn fit_or_load(
    config: &TrainConfig,
    model_config: &EmbeddingConfig,
    data: &LabeledImages,
    num_batches: usize,
    sender: Option<Sender<TrainRecv>>,
) -> Result<(EmbeddingModel, Option<History>)> {
    let [h, w] = data.size();
    if h != w {
        return Err(Error::shape((h, h), (h, w)));
    }
    if !config.do_train {
        info!("skipping training, loading {}", config.checkpoint_path.display());
        let model = EmbeddingModel::load_for(&config.checkpoint_path, model_config, h)?;
        return Ok((model, None));
    }
    let mut model = EmbeddingModel::new(model_config, h, config.seed)?;
    let mut trainer = Trainer::new(config);
    if let Some(sender) = sender {
        trainer = trainer.with_sender(sender);
    }
    let history = trainer.fit(&mut model, data, num_batches)?;
    if history.best_epoch.is_none() {
        warn!("no checkpoint was written");
    }
    Ok((model, Some(history)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel::unbounded;

    fn toy_data(per_class: usize) -> LabeledImages {
        let n = per_class * 3;
        let labels: Vec<u32> = (0..n).map(|i| (i % 3) as u32).collect();
        let images = Array4::from_shape_fn((n, 4, 4, 3), |(b, i, j, c)| {
            let class = b % 3;
            let base = if c == class { 200 } else { 30 };
            (base + (b * 7 + i * 3 + j) % 20) as u8
        });
        LabeledImages::new(images, labels).unwrap()
    }

    fn train_config(dir: &Path) -> TrainConfig {
        let mut config = TrainConfig::default();
        config.adam.lr = 1e-2;
        config.max_epochs = 6;
        config.patience = 2;
        config.checkpoint_path = dir.join("best.bin");
        config
    }

    fn model_config() -> EmbeddingConfig {
        EmbeddingConfig {
            pool: 2,
            hidden_dim: 16,
            embed_dim: 4,
        }
    }

    #[test]
    fn early_stopping_counts_stale_epochs() {
        let mut es = EarlyStopping::new(2, 0.0);
        assert!(!es.update(1.0));
        assert!(!es.update(0.5));
        assert!(!es.update(0.6));
        assert!(!es.update(0.4));
        assert!(!es.update(0.4));
        assert!(es.update(0.45));
        assert_eq!(es.best(), 0.4);

        let mut es = EarlyStopping::new(1, 0.1);
        assert!(!es.update(1.0));
        assert!(es.update(0.95));
    }

    #[test]
    fn checkpoint_keeps_only_the_best() {
        let dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new(&model_config(), 4, 0).unwrap();
        let mut ckpt = ModelCheckpoint::new(&dir.path().join("w.bin"));
        assert!(ckpt.update(1, 2.0, &model).unwrap());
        assert!(!ckpt.update(2, 2.0, &model).unwrap());
        assert!(ckpt.update(3, 1.0, &model).unwrap());
        assert_eq!(ckpt.best_epoch(), Some(3));
        assert!(ckpt.path().exists());
    }

    #[test]
    fn nan_loss_diverges() {
        assert!(check_finite(3, 0.5).is_ok());
        assert!(matches!(check_finite(3, f32::NAN), Err(Error::Divergence { epoch: 3, .. })));
        assert!(check_finite(1, f32::INFINITY).is_err());
    }

    #[test]
    fn fit_reports_progress_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let config = train_config(dir.path());
        let data = toy_data(4);
        let (sender, recv) = unbounded();
        let (model, history) = fit_or_load(&config, &model_config(), &data, 3, Some(sender)).unwrap();
        let history = history.unwrap();
        assert!(history.epochs() >= 1 && history.epochs() <= 6);
        assert!(history.best_epoch.is_some());
        assert!(config.checkpoint_path.exists());
        assert!(history.loss.iter().all(|l| l.is_finite()));
        let events: Vec<TrainRecv> = recv.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, TrainRecv::CHECKPOINT(..))));
        assert_eq!(
            events.iter().filter(|e| matches!(e, TrainRecv::PLOT(k, ..) if k == "loss")).count(),
            history.epochs()
        );
        assert!(history.to_csv().starts_with("epoch,loss,accuracy\n1,"));

        // reload instead of training
        let mut reload = config.clone();
        reload.do_train = false;
        let (loaded, none) = fit_or_load(&reload, &model_config(), &data, 3, None).unwrap();
        assert!(none.is_none());
        assert_eq!(loaded.input_dim(), model.input_dim());
    }

    #[test]
    fn training_lowers_the_loss() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = train_config(dir.path());
        config.max_epochs = 30;
        config.patience = 30;
        let data = toy_data(6);
        let mut model = EmbeddingModel::new(&model_config(), 4, 0).unwrap();
        let history = Trainer::new(&config).fit(&mut model, &data, 4).unwrap();
        assert_eq!(history.epochs(), 30);
        assert!(!history.stopped_early);
        let first = history.loss[..3].iter().sum::<f32>();
        let last = history.loss[27..].iter().sum::<f32>();
        assert!(last < first);
    }

    #[test]
    fn lonely_class_cannot_train() {
        let dir = tempfile::tempdir().unwrap();
        let config = train_config(dir.path());
        let data = toy_data(1);
        let mut model = EmbeddingModel::new(&model_config(), 4, 0).unwrap();
        let err = Trainer::new(&config).fit(&mut model, &data, 1).unwrap_err();
        assert!(matches!(err, Error::InsufficientSamples { .. }));
    }
}
