//! On-disk clip dataset fixture shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use action_fusion_rs::FusionConfig;
use candle_core::{Device, Tensor};

/// Frames per synthetic video: `8 - 2 - 3 = 3` clips per video.
pub const FRAMES: usize = 8;

/// Videos per split.
pub const VIDEOS: usize = 4;

/// Write label dictionaries, frame counts and clip files under `root` and
/// return the `tiny` configuration pointing at them.
pub fn write_dataset(root: &Path) -> FusionConfig {
    let mut config = FusionConfig::tiny_preset();
    let clip_root = root.join("clips");
    let dict_root = root.join("dict");
    std::fs::create_dir_all(&dict_root).expect("Failed to create dict dir");

    let mut train = serde_json::Map::new();
    let mut test = serde_json::Map::new();
    let mut frames = serde_json::Map::new();
    for v in 0..VIDEOS {
        let label = v % config.model.nb_classes + 1;
        for (split, map) in [("train", &mut train), ("test", &mut test)] {
            let video = format!("{split}_{v:02}");
            map.insert(video.clone(), label.into());
            frames.insert(video.clone(), FRAMES.into());
            write_clips(&config, &clip_root.join(&video), label);
        }
    }

    let write_json = |name: &str, map: serde_json::Map<String, serde_json::Value>| {
        let path = dict_root.join(name);
        std::fs::write(&path, serde_json::Value::Object(map).to_string())
            .expect("Failed to write dictionary");
        path.to_string_lossy().into_owned()
    };
    config.data.train_labels = write_json("train_video.json", train);
    config.data.test_labels = write_json("test_video.json", test);
    config.data.frame_count = write_json("frame_count.json", frames);
    config.data.clip_root = clip_root.to_string_lossy().into_owned();
    config.data.num_workers = 2;
    config.output_dir = root.join("record").to_string_lossy().into_owned();
    config
}

fn write_clips(config: &FusionConfig, dir: &Path, label: usize) {
    std::fs::create_dir_all(dir).expect("Failed to create clip dir");
    let size = config.model.input_size;
    let clips = FRAMES - config.model.clip_length() - 3;
    for start in 1..=clips {
        let mut tensors = HashMap::new();
        for stream in &config.model.streams {
            let channels = stream.modality.input_channels(stream.nb_per_stack).unwrap();
            let noise = Tensor::randn(0f32, 0.1, (channels, size, size), &Device::Cpu).unwrap();
            let offset = label as f64 * 0.25 + start as f64 * 0.01;
            let x = (noise + offset).unwrap();
            tensors.insert(stream.modality.name().to_string(), x);
        }
        candle_core::safetensors::save(&tensors, dir.join(format!("{start:05}.safetensors")))
            .expect("Failed to write clip");
    }
}
