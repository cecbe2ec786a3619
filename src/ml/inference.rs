//! 学習済みモデルによる推論

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use std::path::Path;

use crate::ml::checkpoint::load_checkpoint;
use crate::ml::ml_model::{load_and_normalize_image, EmotionClassifier};
use crate::model::ModelMetadata;

/// 1枚の画像に対する推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// 予測したクラス名
    pub label: String,
    /// 予測したクラスID
    pub class_index: usize,
    /// 予測クラスの確率
    pub confidence: f32,
    /// 全クラスの確率（クラスID順）
    pub probabilities: Vec<f32>,
}

/// 推論エンジン
pub struct EmotionPredictor<B: Backend> {
    model: EmotionClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> EmotionPredictor<B> {
    /// チェックポイントを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(checkpoint_path: P, device: B::Device) -> Result<Self> {
        let path = checkpoint_path.as_ref();
        let (model, metadata) = load_checkpoint::<B>(path, &device)
            .with_context(|| format!("チェックポイントを読み込めません: {}", path.display()))?;

        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 単一画像を分類
    pub fn predict_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let mut predictions = self.predict_batch(&[image_path])?;
        predictions
            .pop()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    /// 複数画像をまとめて分類
    pub fn predict_batch<P: AsRef<Path>>(&self, image_paths: &[P]) -> Result<Vec<Prediction>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.metadata.image_size;
        let mut all_pixels = Vec::with_capacity(image_paths.len() * 3 * size * size);
        for path in image_paths {
            all_pixels.extend(load_and_normalize_image(path.as_ref(), size)?);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([image_paths.len(), 3, size, size]);
        let probabilities = self
            .model
            .probabilities(images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let num_classes = self.metadata.num_classes();
        probabilities
            .chunks(num_classes)
            .map(|row| self.to_prediction(row))
            .collect()
    }

    fn to_prediction(&self, row: &[f32]) -> Result<Prediction> {
        let (class_index, confidence) = row
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow::anyhow!("クラスがありません"))?;

        let label = self
            .metadata
            .class_name(class_index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?
            .to_string();

        Ok(Prediction {
            label,
            class_index,
            confidence,
            probabilities: row.to_vec(),
        })
    }
}
