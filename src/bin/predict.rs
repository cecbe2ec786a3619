//! 推論: 学習済みチェックポイントで画像を分類
//!
//! 使い方: predict <image> [<image> ...]
//!
//! 画像を指定しない場合はチェックポイントの情報だけを表示します。

#![recursion_limit = "256"]

use aura_emotion_lib::logging::init_logging;
use aura_emotion_lib::ml::EmotionPredictor;
use aura_emotion_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};
use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};
use tracing::error;

fn run<B: Backend>(checkpoint: &str, images: &[PathBuf], device: B::Device) -> anyhow::Result<()> {
    let predictor = EmotionPredictor::<B>::load(checkpoint, device)?;
    print_metadata_info(predictor.metadata());

    for (path, prediction) in images.iter().zip(predictor.predict_batch(images)?) {
        println!(
            "{}: {} ({:.1}%)",
            path.display(),
            prediction.label,
            prediction.confidence * 100.0
        );
    }
    Ok(())
}

fn main() {
    init_logging();

    let images: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    let config = AppConfig::load_or_default();
    let checkpoint = &config.training.checkpoint_path;

    if images.is_empty() {
        match load_metadata(Path::new(checkpoint)) {
            Ok(metadata) => print_metadata_info(&metadata),
            Err(e) => error!("[ERROR] {}: {:#}", checkpoint, e),
        }
        eprintln!("使い方: predict <image> [<image> ...]");
        std::process::exit(2);
    }

    let result = match config.device_type {
        DeviceType::Wgpu => run::<burn_wgpu::Wgpu>(checkpoint, &images, Default::default()),
        DeviceType::Cpu => run::<burn_ndarray::NdArray<f32>>(checkpoint, &images, Default::default()),
    };

    if let Err(e) = result {
        error!("[ERROR] {:#}", e);
        std::process::exit(1);
    }
}
