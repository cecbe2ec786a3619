//! 学習済みモデルのチェックポイント
//!
//! burnのレコードをバイト列にしてメタデータと一緒にtar.gzへ格納します。

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::path::{Path, PathBuf};

use crate::ml::ml_model::{EmotionClassifier, ModelConfig};
use crate::model::{load_model_with_metadata, save_model_with_metadata, ModelMetadata};

/// モデルの重みをバイト列に変換（f32精度）
pub fn model_to_bytes<B: Backend>(model: &EmotionClassifier<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// モデルとメタデータをチェックポイントに保存
pub fn save_checkpoint<B: Backend>(
    model: &EmotionClassifier<B>,
    metadata: &ModelMetadata,
    path: &Path,
) -> Result<PathBuf> {
    let model_binary = model_to_bytes(model)?;
    save_model_with_metadata(path, metadata, &model_binary)
}

/// メタデータに合わせてモデルを組み立て、チェックポイントの重みを復元
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(EmotionClassifier<B>, ModelMetadata)> {
    let (metadata, model_binary) = load_model_with_metadata(path)?;

    // 推論時はドロップアウトなし
    let model = ModelConfig::new(metadata.num_classes())
        .with_image_size(metadata.image_size)
        .with_channels(metadata.channels)
        .with_hidden_units(metadata.hidden_units)
        .with_dropout(0.0)
        .init::<B>(device)?;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((model.load_record(record), metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_checkpoint_round_trip_preserves_outputs() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("emotion_best.tar.gz");

        let model = ModelConfig::new(4)
            .with_image_size(32)
            .with_dropout(0.0)
            .init::<TestBackend>(&device)
            .unwrap();
        let metadata = ModelMetadata::new(
            vec!["angry".into(), "happy".into(), "neutral".into(), "sad".into()],
            32,
            3,
            128,
            0.5,
            3,
            0.75,
            0.61,
        );
        save_checkpoint(&model, &metadata, &path).unwrap();

        let (restored, restored_metadata) = load_checkpoint::<TestBackend>(&path, &device).unwrap();
        assert_eq!(restored_metadata, metadata);
        assert_eq!(restored.num_classes(), 4);

        let images = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let expected = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = restored.forward(images).into_data().to_vec::<f32>().unwrap();
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
