use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::data::{ClassIndex, LabeledImages};
use crate::{Error, Result};

/// One anchor and one positive per class, row i of both belongs to class i.
#[derive(Debug, Clone)]
pub struct PairBatch {
    pub anchors: Array4<f32>,
    pub positives: Array4<f32>,
    pub anchor_idx: Vec<usize>,
    pub positive_idx: Vec<usize>,
}

impl PairBatch {
    pub fn num_classes(&self) -> usize {
        self.anchor_idx.len()
    }
}

/// A finite, restartable sequence of `num_batches` anchor/positive batches.
///
/// Every batch draws, for every class, an anchor and a positive uniformly at
/// random from the samples of that class, the positive being redrawn until
/// it differs from the anchor.
pub struct AnchorPositivePairs<'a> {
    data: &'a LabeledImages,
    index: ClassIndex,
    num_batches: usize,
    cursor: usize,
    seed: u64,
    rng: StdRng,
}

impl<'a> AnchorPositivePairs<'a> {
    pub fn new(data: &'a LabeledImages, index: ClassIndex, num_batches: usize, seed: u64) -> Result<Self> {
        for (class, group) in index.iter() {
            if group.len() < 2 {
                return Err(Error::InsufficientSamples {
                    class,
                    count: group.len(),
                });
            }
        }
        if index.num_classes() == 0 {
            return Err(Error::invalid("num_classes", 0, "no classes to sample from"));
        }
        Ok(AnchorPositivePairs {
            data,
            index,
            num_batches,
            cursor: 0,
            seed,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Indexes the labels of `data` itself, with `num_classes = max label + 1`.
    pub fn from_data(data: &'a LabeledImages, num_batches: usize, seed: u64) -> Result<Self> {
        let num_classes = data.labels.iter().max().map_or(0, |&m| m as usize + 1);
        let index = ClassIndex::new(&data.labels, num_classes)?;
        Self::new(data, index, num_batches, seed)
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn index(&self) -> &ClassIndex {
        &self.index
    }

    /// Starts the sequence over with the initial seed.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    /// Starts the sequence over, continuing the random stream.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    fn draw(&mut self) -> (Vec<usize>, Vec<usize>) {
        let mut anchors = Vec::with_capacity(self.index.num_classes());
        let mut positives = Vec::with_capacity(self.index.num_classes());
        for (_, group) in self.index.iter() {
            let a = self.rng.gen_range(0..group.len());
            let mut p = self.rng.gen_range(0..group.len());
            while p == a {
                p = self.rng.gen_range(0..group.len());
            }
            anchors.push(group[a]);
            positives.push(group[p]);
        }
        (anchors, positives)
    }
}

impl<'a> Iterator for AnchorPositivePairs<'a> {
    type Item = PairBatch;

    fn next(&mut self) -> Option<PairBatch> {
        if self.cursor >= self.num_batches {
            return None;
        }
        self.cursor += 1;
        let (anchor_idx, positive_idx) = self.draw();
        Some(PairBatch {
            anchors: self.data.images_f32(&anchor_idx),
            positives: self.data.images_f32(&positive_idx),
            anchor_idx,
            positive_idx,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.num_batches - self.cursor;
        (left, Some(left))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array4;

    fn toy(labels: Vec<u32>) -> LabeledImages {
        let n = labels.len();
        let images = Array4::from_shape_fn((n, 2, 2, 3), |(i, ..)| i as u8);
        LabeledImages::new(images, labels).unwrap()
    }

    #[test]
    fn anchor_and_positive_differ() {
        let data = toy(vec![0, 1, 2, 0, 1, 2, 1, 0, 2]);
        let sampler = AnchorPositivePairs::from_data(&data, 200, 0).unwrap();
        let mut seen = 0;
        for batch in sampler {
            assert_eq!(batch.num_classes(), 3);
            assert_eq!(batch.anchors.dim(), (3, 2, 2, 3));
            for c in 0..3 {
                let (a, p) = (batch.anchor_idx[c], batch.positive_idx[c]);
                assert_ne!(a, p);
                assert_eq!(data.labels[a], c as u32);
                assert_eq!(data.labels[p], c as u32);
                assert_eq!(batch.positives[[c, 0, 0, 0]], p as f32);
            }
            seen += 1;
        }
        assert_eq!(seen, 200);
    }

    #[test]
    fn two_samples_always_pair_up() {
        let data = toy(vec![0, 0]);
        let mut sampler = AnchorPositivePairs::from_data(&data, 20, 3).unwrap();
        for batch in sampler.by_ref() {
            assert_eq!(batch.anchor_idx[0] + batch.positive_idx[0], 1);
        }
        assert!(sampler.next().is_none());
    }

    #[test]
    fn reset_replays_the_sequence() {
        let data = toy(vec![0, 1, 0, 1, 0, 1]);
        let mut sampler = AnchorPositivePairs::from_data(&data, 4, 11).unwrap();
        let first: Vec<_> = sampler.by_ref().map(|b| b.anchor_idx).collect();
        sampler.reset();
        let second: Vec<_> = sampler.by_ref().map(|b| b.anchor_idx).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn lonely_class_is_an_error() {
        let data = toy(vec![0, 0, 1, 2, 2]);
        let err = AnchorPositivePairs::from_data(&data, 1, 0).err().unwrap();
        assert!(matches!(err, Error::InsufficientSamples { class: 1, count: 1 }));
        // a class id without any sample
        let data = toy(vec![0, 0, 2, 2]);
        assert!(AnchorPositivePairs::from_data(&data, 1, 0).is_err());
    }
}
