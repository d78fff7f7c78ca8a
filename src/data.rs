//! Clip data supply.
//!
//! This module provides:
//! - [`ClipDataset`] - random-access source of decoded clips
//! - [`SafetensorsDecoder`] - reads `<clip_root>/<video>/<start:05>.safetensors`
//! - [`IndexedClipDataset`] - a clip index paired with a decoder
//! - [`DataLoader`] - batches clips with background workers and a bounded,
//!   in-order prefetch window
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use action_fusion_rs::data::{DataLoader, IndexedClipDataset, LoaderOptions, SafetensorsDecoder};
//! use action_fusion_rs::index::VideoIndex;
//! use action_fusion_rs::FusionConfig;
//! use candle_core::Device;
//!
//! # fn main() -> action_fusion_rs::Result<()> {
//! let config = FusionConfig::from_file("fusion.yaml")?;
//! let index = VideoIndex::from_config(&config)?;
//! let decoder = Arc::new(SafetensorsDecoder::from_config(&config)?);
//! let dataset = Arc::new(IndexedClipDataset::new(index.val, decoder));
//!
//! let options = LoaderOptions::from_config(&config);
//! for batch in DataLoader::sequential(dataset, options, Device::Cpu) {
//!     let batch = batch?;
//!     println!("{} clips from {:?}", batch.len(), batch.videos.first());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{FusionConfig, Modality};
use crate::error::{FusionError, Result};
use crate::index::ClipRef;
use crate::model::StreamInputs;

/// One decoded clip. Each input is `(channels, H, W)`.
#[derive(Debug, Clone)]
pub struct ClipSample {
    /// Source video.
    pub video: String,
    /// Per-modality stacks.
    pub inputs: BTreeMap<Modality, Tensor>,
    /// Class index.
    pub label: usize,
}

/// Random-access clip source shared with loader workers.
pub trait ClipDataset: Send + Sync {
    /// Number of clips.
    fn len(&self) -> usize;

    /// Whether the dataset has no clips.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode clip `idx`.
    fn get(&self, idx: usize) -> Result<ClipSample>;
}

/// Turns a clip reference into per-modality tensors.
pub trait ClipDecoder: Send + Sync {
    /// Decode the stacks of one clip.
    fn decode(&self, clip: &ClipRef) -> Result<BTreeMap<Modality, Tensor>>;
}

/// Decoder for pre-stacked clips stored as safetensors files, one tensor per
/// modality name (`rgb`, `pose`, `flow`).
#[derive(Debug, Clone)]
pub struct SafetensorsDecoder {
    root: PathBuf,
    streams: Vec<(Modality, usize)>,
    input_size: usize,
}

impl SafetensorsDecoder {
    /// Decoder for `streams` given as `(modality, channels)`.
    pub fn new(root: impl Into<PathBuf>, streams: Vec<(Modality, usize)>, input_size: usize) -> Self {
        Self {
            root: root.into(),
            streams,
            input_size,
        }
    }

    /// Decoder for the streams configured in `config`.
    pub fn from_config(config: &FusionConfig) -> Result<Self> {
        let streams = config
            .model
            .streams
            .iter()
            .map(|s| Ok((s.modality, s.modality.input_channels(s.nb_per_stack)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            &config.data.clip_root,
            streams,
            config.model.input_size,
        ))
    }

    /// File holding `clip`.
    #[must_use]
    pub fn clip_path(&self, clip: &ClipRef) -> PathBuf {
        self.root
            .join(&clip.video)
            .join(format!("{:05}.safetensors", clip.start))
    }
}

impl ClipDecoder for SafetensorsDecoder {
    fn decode(&self, clip: &ClipRef) -> Result<BTreeMap<Modality, Tensor>> {
        let path = self.clip_path(clip);
        let mut tensors: HashMap<String, Tensor> = candle_core::safetensors::load(&path, &Device::Cpu)
            .map_err(|e| FusionError::Dataset(format!("cannot read clip {}: {e}", path.display())))?;

        let mut inputs = BTreeMap::new();
        for &(modality, channels) in &self.streams {
            let tensor = tensors.remove(modality.name()).ok_or_else(|| {
                FusionError::Dataset(format!("{} has no '{}' tensor", path.display(), modality))
            })?;
            let expected = [channels, self.input_size, self.input_size];
            if tensor.dims() != expected {
                return Err(FusionError::Dataset(format!(
                    "'{}' in {} has shape {:?}, expected {:?}",
                    modality,
                    path.display(),
                    tensor.dims(),
                    expected
                )));
            }
            inputs.insert(modality, tensor.to_dtype(DType::F32)?);
        }
        Ok(inputs)
    }
}

/// A clip list decoded on demand.
pub struct IndexedClipDataset {
    clips: Vec<ClipRef>,
    decoder: Arc<dyn ClipDecoder>,
}

impl IndexedClipDataset {
    /// Pair `clips` with `decoder`.
    pub fn new(clips: Vec<ClipRef>, decoder: Arc<dyn ClipDecoder>) -> Self {
        Self { clips, decoder }
    }
}

impl ClipDataset for IndexedClipDataset {
    fn len(&self) -> usize {
        self.clips.len()
    }

    fn get(&self, idx: usize) -> Result<ClipSample> {
        let clip = self
            .clips
            .get(idx)
            .ok_or_else(|| FusionError::Dataset(format!("clip index {idx} out of range")))?;
        Ok(ClipSample {
            video: clip.video.clone(),
            inputs: self.decoder.decode(clip)?,
            label: clip.label,
        })
    }
}

/// A collated mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Video of every clip, in batch order.
    pub videos: Vec<String>,
    /// Per-modality `(batch, channels, H, W)` tensors.
    pub inputs: StreamInputs,
    /// Class index of every clip.
    pub labels: Vec<usize>,
}

impl Batch {
    /// Stack samples along a new batch dimension.
    pub fn collate(samples: Vec<ClipSample>) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(FusionError::Dataset("cannot collate an empty batch".into()));
        };
        let modalities: Vec<Modality> = first.inputs.keys().copied().collect();

        let mut inputs = StreamInputs::new();
        for modality in modalities {
            let stacks = samples
                .iter()
                .map(|s| {
                    s.inputs.get(&modality).ok_or_else(|| {
                        FusionError::Dataset(format!("clip of '{}' has no '{}' input", s.video, modality))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            inputs.insert(modality, Tensor::stack(&stacks, 0)?);
        }

        let mut videos = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for sample in samples {
            videos.push(sample.video);
            labels.push(sample.label);
        }
        Ok(Self {
            videos,
            inputs,
            labels,
        })
    }

    /// Number of clips.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch holds no clips.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels as a u32 tensor.
    pub fn label_tensor(&self, device: &Device) -> Result<Tensor> {
        let labels: Vec<u32> = self.labels.iter().map(|&l| l as u32).collect();
        Ok(Tensor::from_vec(labels, self.labels.len(), device)?)
    }

    fn to_device(mut self, device: &Device) -> Result<Self> {
        for tensor in self.inputs.values_mut() {
            *tensor = tensor.to_device(device)?;
        }
        Ok(self)
    }
}

/// Batching and prefetch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Clips per batch (the last batch may be smaller).
    pub batch_size: usize,
    /// Background decode workers (0 decodes on the calling thread).
    pub num_workers: usize,
    /// Batches in flight per worker.
    pub prefetch_factor: usize,
}

impl LoaderOptions {
    /// Options from the training and data sections of `config`.
    #[must_use]
    pub fn from_config(config: &FusionConfig) -> Self {
        Self {
            batch_size: config.training.batch_size,
            num_workers: config.data.num_workers,
            prefetch_factor: config.data.prefetch_factor,
        }
    }
}

/// Visiting order for one epoch: identity, or a permutation seeded by `seed`.
#[must_use]
pub fn epoch_order(len: usize, seed: Option<u64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Some(seed) = seed {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
}

#[derive(Default)]
struct LoaderState {
    next_claim: usize,
    next_deliver: usize,
    ready: BTreeMap<usize, Result<Batch>>,
    stop: bool,
}

struct Shared {
    state: Mutex<LoaderState>,
    /// A batch landed in `ready`.
    batch_ready: Condvar,
    /// A batch was consumed, or the loader is stopping.
    slot_free: Condvar,
}

/// Batched iterator over a [`ClipDataset`].
///
/// Batches are delivered in visiting order. With `num_workers > 0`, workers
/// decode ahead of the consumer but never more than
/// `num_workers * prefetch_factor` batches past the last delivered one.
pub struct DataLoader {
    dataset: Arc<dyn ClipDataset>,
    order: Arc<Vec<usize>>,
    options: LoaderOptions,
    device: Device,
    num_batches: usize,
    delivered: usize,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl DataLoader {
    /// Loader visiting clips in `order`.
    pub fn new(
        dataset: Arc<dyn ClipDataset>,
        order: Vec<usize>,
        options: LoaderOptions,
        device: Device,
    ) -> Self {
        let batch_size = options.batch_size.max(1);
        let num_batches = order.len().div_ceil(batch_size);
        let mut loader = Self {
            dataset,
            order: Arc::new(order),
            options: LoaderOptions {
                batch_size,
                ..options
            },
            device,
            num_batches,
            delivered: 0,
            shared: Arc::new(Shared {
                state: Mutex::new(LoaderState::default()),
                batch_ready: Condvar::new(),
                slot_free: Condvar::new(),
            }),
            workers: Vec::new(),
        };
        if loader.options.num_workers > 0 && num_batches > 0 {
            loader.start_workers();
        }
        loader
    }

    /// Loader visiting clips in index order.
    pub fn sequential(dataset: Arc<dyn ClipDataset>, options: LoaderOptions, device: Device) -> Self {
        let order = epoch_order(dataset.len(), None);
        Self::new(dataset, order, options, device)
    }

    /// Loader visiting clips in an order shuffled by `seed`.
    pub fn shuffled(
        dataset: Arc<dyn ClipDataset>,
        options: LoaderOptions,
        seed: u64,
        device: Device,
    ) -> Self {
        let order = epoch_order(dataset.len(), Some(seed));
        Self::new(dataset, order, options, device)
    }

    /// Number of batches this loader yields.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn start_workers(&mut self) {
        let capacity = (self.options.num_workers * self.options.prefetch_factor).max(1);
        for _ in 0..self.options.num_workers {
            let dataset = Arc::clone(&self.dataset);
            let order = Arc::clone(&self.order);
            let shared = Arc::clone(&self.shared);
            let batch_size = self.options.batch_size;
            let num_batches = self.num_batches;

            let handle = thread::spawn(move || loop {
                let batch_idx = {
                    let Ok(mut state) = shared.state.lock() else {
                        return;
                    };
                    loop {
                        if state.stop || state.next_claim >= num_batches {
                            return;
                        }
                        if state.next_claim < state.next_deliver + capacity {
                            break;
                        }
                        state = match shared.slot_free.wait(state) {
                            Ok(guard) => guard,
                            Err(_) => return,
                        };
                    }
                    state.next_claim += 1;
                    state.next_claim - 1
                };

                let batch = load_batch(dataset.as_ref(), &order, batch_idx, batch_size);

                let Ok(mut state) = shared.state.lock() else {
                    return;
                };
                state.ready.insert(batch_idx, batch);
                shared.batch_ready.notify_all();
            });
            self.workers.push(handle);
        }
    }

    fn next_from_workers(&mut self) -> Result<Batch> {
        let mut state = self.shared.state.lock().map_err(poisoned)?;
        loop {
            let wanted = state.next_deliver;
            if let Some(batch) = state.ready.remove(&wanted) {
                state.next_deliver += 1;
                self.shared.slot_free.notify_all();
                return batch;
            }
            state = self.shared.batch_ready.wait(state).map_err(poisoned)?;
        }
    }

    fn stop_workers(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.stop = true;
        }
        self.shared.slot_free.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> FusionError {
    FusionError::Training("data loader state poisoned".into())
}

fn load_batch(
    dataset: &dyn ClipDataset,
    order: &[usize],
    batch_idx: usize,
    batch_size: usize,
) -> Result<Batch> {
    let start = batch_idx * batch_size;
    let end = (start + batch_size).min(order.len());
    let samples = order[start..end]
        .iter()
        .map(|&idx| dataset.get(idx))
        .collect::<Result<Vec<_>>>()?;
    Batch::collate(samples)
}

impl Iterator for DataLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.delivered >= self.num_batches {
            return None;
        }
        let batch = if self.workers.is_empty() {
            load_batch(
                self.dataset.as_ref(),
                &self.order,
                self.delivered,
                self.options.batch_size,
            )
        } else {
            self.next_from_workers()
        };
        self.delivered += 1;
        Some(batch.and_then(|b| b.to_device(&self.device)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.delivered;
        (remaining, Some(remaining))
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Clip `i` is a constant-`i` tensor of video `v{i / 3}`.
    struct Counting {
        len: usize,
        calls: AtomicUsize,
    }

    impl ClipDataset for Counting {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, idx: usize) -> Result<ClipSample> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let x = Tensor::full(idx as f32, (1, 2, 2), &Device::Cpu)?;
            Ok(ClipSample {
                video: format!("v{}", idx / 3),
                inputs: BTreeMap::from([(Modality::Pose, x)]),
                label: idx % 2,
            })
        }
    }

    fn dataset(len: usize) -> Arc<Counting> {
        Arc::new(Counting {
            len,
            calls: AtomicUsize::new(0),
        })
    }

    fn options(batch_size: usize, num_workers: usize) -> LoaderOptions {
        LoaderOptions {
            batch_size,
            num_workers,
            prefetch_factor: 2,
        }
    }

    fn first_values(batch: &Batch) -> Vec<f32> {
        let x = &batch.inputs[&Modality::Pose];
        let rows: Vec<Vec<f32>> = x.flatten_from(1).unwrap().to_vec2().unwrap();
        rows.iter().map(|r| r[0]).collect()
    }

    #[test]
    fn test_sequential_batches() {
        let loader = DataLoader::sequential(dataset(7), options(3, 0), Device::Cpu);
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<Batch> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(first_values(&batches[0]), vec![0.0, 1.0, 2.0]);
        assert_eq!(batches[0].inputs[&Modality::Pose].dims(), &[3, 1, 2, 2]);
        assert_eq!(batches[1].videos, vec!["v1", "v1", "v1"]);
        assert_eq!(batches[0].labels, vec![0, 1, 0]);
    }

    #[test]
    fn test_workers_preserve_order() {
        let single: Vec<Vec<f32>> = DataLoader::shuffled(dataset(50), options(4, 0), 9, Device::Cpu)
            .map(|b| first_values(&b.unwrap()))
            .collect();
        let parallel: Vec<Vec<f32>> =
            DataLoader::shuffled(dataset(50), options(4, 3), 9, Device::Cpu)
                .map(|b| first_values(&b.unwrap()))
                .collect();
        assert_eq!(single, parallel);
        assert_eq!(parallel.len(), 13);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        assert_eq!(epoch_order(20, Some(1)), epoch_order(20, Some(1)));
        assert_ne!(epoch_order(20, Some(1)), epoch_order(20, Some(2)));
        let mut sorted = epoch_order(20, Some(3));
        sorted.sort_unstable();
        assert_eq!(sorted, epoch_order(20, None));
    }

    #[test]
    fn test_prefetch_is_bounded() {
        let ds = dataset(100);
        let mut loader = DataLoader::sequential(ds.clone(), options(1, 2), Device::Cpu);
        assert!(loader.next().is_some());
        std::thread::sleep(std::time::Duration::from_millis(100));
        // one delivered plus at most workers * prefetch_factor ahead
        assert!(ds.calls.load(Ordering::SeqCst) <= 1 + 4);
        drop(loader);
    }

    #[test]
    fn test_collate_rejects_empty() {
        assert!(Batch::collate(Vec::new()).is_err());
    }

    #[test]
    fn test_label_tensor() {
        let batch = DataLoader::sequential(dataset(4), options(4, 0), Device::Cpu)
            .next()
            .unwrap()
            .unwrap();
        let labels: Vec<u32> = batch.label_tensor(&Device::Cpu).unwrap().to_vec1().unwrap();
        assert_eq!(labels, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_safetensors_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let video_dir = dir.path().join("brush_hair_1");
        std::fs::create_dir_all(&video_dir).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "flow".to_string(),
            Tensor::zeros((4, 8, 8), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "rgb".to_string(),
            Tensor::ones((3, 8, 8), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, video_dir.join("00011.safetensors")).unwrap();

        let decoder = SafetensorsDecoder::new(
            dir.path(),
            vec![(Modality::Rgb, 3), (Modality::Flow, 4)],
            8,
        );
        let clip = ClipRef {
            video: "brush_hair_1".into(),
            start: 11,
            label: 0,
        };
        let inputs = decoder.decode(&clip).unwrap();
        assert_eq!(inputs[&Modality::Rgb].dims(), &[3, 8, 8]);
        assert_eq!(inputs[&Modality::Flow].dims(), &[4, 8, 8]);

        let wrong = SafetensorsDecoder::new(dir.path(), vec![(Modality::Flow, 20)], 8);
        assert!(matches!(wrong.decode(&clip), Err(FusionError::Dataset(_))));

        let missing = ClipRef { start: 12, ..clip };
        assert!(matches!(decoder.decode(&missing), Err(FusionError::Dataset(_))));

        let dataset = IndexedClipDataset::new(vec![missing], Arc::new(decoder));
        assert_eq!(dataset.len(), 1);
        assert!(dataset.get(0).is_err());
        assert!(dataset.get(1).is_err());
    }
}
