use action_fusion_rs::metrics::CrossEntropy;
use action_fusion_rs::VideoAccumulator;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const NB_CLASSES: usize = 12;

// (video, prediction, label) triples, `clips_per_video` clips for each video
fn clip_predictions(videos: usize, clips_per_video: usize) -> Vec<(String, Vec<f32>, usize)> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut clips = Vec::with_capacity(videos * clips_per_video);
    for v in 0..videos {
        for _ in 0..clips_per_video {
            let prediction = (0..NB_CLASSES).map(|_| rng.gen_range(-4.0..4.0)).collect();
            clips.push((format!("video_{v:05}"), prediction, v % NB_CLASSES));
        }
    }
    clips
}

fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");
    for videos in [100, 1000] {
        let clips = clip_predictions(videos, 8);
        group.bench_with_input(BenchmarkId::from_parameter(videos), &clips, |b, clips| {
            b.iter(|| {
                let mut acc = VideoAccumulator::new(NB_CLASSES);
                for (video, prediction, label) in clips {
                    acc.add(video, prediction, *label).unwrap();
                }
                black_box(acc.len())
            });
        });
    }
    group.finish();
}

fn bench_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("finalize");
    for videos in [100, 1000] {
        let mut acc = VideoAccumulator::new(NB_CLASSES);
        for (video, prediction, label) in clip_predictions(videos, 8) {
            acc.add(&video, &prediction, label).unwrap();
        }
        group.bench_with_input(BenchmarkId::from_parameter(videos), &acc, |b, acc| {
            b.iter(|| black_box(acc.finalize(&CrossEntropy).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_accumulate, bench_finalize);
criterion_main!(benches);
