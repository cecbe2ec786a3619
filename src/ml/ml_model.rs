//! 感情分類モデルの定義
//!
//! 事前学習済みMobileNetV2（凍結）+ 小さな分類ヘッドによる転移学習モデルと、
//! 画像の正規化処理を提供します。

use anyhow::{bail, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    tensor::{
        activation::{log_softmax, relu, softmax},
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use std::path::Path;
use tracing::info;

use crate::ml::backbone::{MobileNetV2, MobileNetV2Config, FEATURE_CHANNELS};
use crate::ml::dataset::EmotionBatch;

/// ImageNetの平均（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 特徴抽出器が要求する入力チャネル数
pub const REQUIRED_CHANNELS: usize = 3;

/// 特徴抽出器が受け付ける最小の入力サイズ
pub const MIN_IMAGE_SIZE: usize = 32;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 48)]
    pub image_size: usize,
    /// 入力チャネル数
    #[config(default = 3)]
    pub channels: usize,
    /// 分類ヘッドの中間層ユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    /// 入力形状とクラス数を検証
    pub fn validate(&self) -> Result<()> {
        if self.channels != REQUIRED_CHANNELS {
            bail!(
                "入力チャネル数が不正です: {} (事前学習済み特徴抽出器は{}チャネルが必要)",
                self.channels,
                REQUIRED_CHANNELS
            );
        }
        if self.num_classes == 0 {
            bail!("クラス数は1以上が必要です");
        }
        if self.image_size < MIN_IMAGE_SIZE {
            bail!(
                "入力サイズが小さすぎます: {} (最小{}x{}が必要)",
                self.image_size,
                MIN_IMAGE_SIZE,
                MIN_IMAGE_SIZE
            );
        }
        Ok(())
    }

    /// モデルを初期化（特徴抽出器はランダム初期化のまま凍結）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EmotionClassifier<B>> {
        self.init_with_weights(None, device)
    }

    /// 事前学習済みの重みを読み込んでモデルを初期化
    ///
    /// 特徴抽出器は読み込み後に凍結され、分類ヘッドのみが学習対象になります。
    pub fn init_with_weights<B: Backend>(
        &self,
        pretrained_weights: Option<&Path>,
        device: &B::Device,
    ) -> Result<EmotionClassifier<B>> {
        self.validate()?;

        let backbone = MobileNetV2Config::new()
            .with_channels(self.channels)
            .init(device)
            .with_pretrained(pretrained_weights, device)?
            .no_grad();

        info!(
            "[Model] 入力 {}x{}x{} -> MobileNetV2 (凍結) -> GAP {}",
            self.image_size, self.image_size, self.channels, FEATURE_CHANNELS
        );
        info!(
            "[Model] ヘッド: {} -> {} (ReLU, dropout={}) -> {} (softmax)",
            FEATURE_CHANNELS, self.hidden_units, self.dropout, self.num_classes
        );

        Ok(EmotionClassifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(FEATURE_CHANNELS, self.hidden_units).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
        })
    }
}

/// 感情分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2 特徴抽出器（凍結）
/// - Global Average Pooling
/// - FC: 1280 -> hidden + ReLU
/// - Dropout
/// - FC: hidden -> num_classes
/// - Softmax（`probabilities`）
#[derive(Module, Debug)]
pub struct EmotionClassifier<B: Backend> {
    backbone: MobileNetV2<B>,
    pool: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> EmotionClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.backbone.forward(images);
        let x = self.pool.forward(x);
        let x = x.reshape([batch_size, FEATURE_CHANNELS]);

        let x = relu(self.hidden.forward(x));
        let x = self.dropout.forward(x);

        self.output.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]（各行の和は1）
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 出力層のユニット数
    pub fn num_classes(&self) -> usize {
        self.output.weight.val().dims()[1]
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// one-hotターゲットに対するカテゴリカル交差エントロピーを計算します。
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `targets`: one-hotターゲット [batch_size, num_classes]
    /// - `labels`: クラスID [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = categorical_cross_entropy(output.clone(), targets);

        ClassificationOutput::new(loss, output, labels)
    }
}

/// one-hotターゲットに対するカテゴリカル交差エントロピー（バッチ平均）
pub fn categorical_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (log_probs * targets).sum_dim(1).mean().neg()
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<EmotionBatch<B>, ClassificationOutput<B>> for EmotionClassifier<B> {
    fn step(&self, batch: EmotionBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets, batch.labels);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<EmotionBatch<B>, ClassificationOutput<B>> for EmotionClassifier<B> {
    fn step(&self, batch: EmotionBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets, batch.labels)
    }
}

/// HWC順のRGB画素（0-255）をImageNet正規化したCHW順に並べ替える
pub fn normalize_pixels(pixels: &[u8], image_size: usize) -> Vec<f32> {
    let plane = image_size * image_size;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, rgb) in pixels.chunks_exact(3).take(plane).enumerate() {
        for channel in 0..3 {
            let value = rgb[channel] as f32 / 255.0;
            data[channel * plane + i] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    data
}

/// 画像を読み込んでリサイズし、正規化済みのCHW配列を返す
pub fn load_and_normalize_image(path: &Path, image_size: usize) -> Result<Vec<f32>> {
    let pixels = crate::ml::dataset::load_rgb_pixels(path, image_size)?;
    Ok(normalize_pixels(&pixels, image_size))
}
