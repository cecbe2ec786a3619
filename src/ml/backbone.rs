//! MobileNetV2 特徴抽出器
//!
//! 分類ヘッドを除いたMobileNetV2本体です。BatchNormは推論時の統計量で固定した
//! アフィン変換として実装しているため、学習中にも統計量は更新されません。
//!
//! 事前学習済みの重みはImageNetのsafetensors / PyTorchファイル（`pretrained` モジュール）か、
//! burnのバイナリレコード（`BinFileRecorder`）から読み込みます。

use anyhow::Result;
use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};
use std::path::Path;
use tracing::{info, warn};

use crate::ml::pretrained::{load_imagenet_weights, WeightsFormat};

/// 出力特徴のチャネル数
pub const FEATURE_CHANNELS: usize = 1280;

/// ステムの出力チャネル数
const STEM_CHANNELS: usize = 32;

/// BatchNormの分母に加えるε
const BN_EPSILON: f64 = 1e-5;

/// 逆残差ブロックの構成 (拡張率 t, 出力チャネル c, 繰り返し n, 最初のストライド s)
pub(crate) const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// 統計量を固定したBatchNorm
///
/// y = (x - mean) / sqrt(var + ε) * weight + bias
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    weight: Param<Tensor<B, 1>>,
    bias: Param<Tensor<B, 1>>,
    running_mean: Param<Tensor<B, 1>>,
    running_var: Param<Tensor<B, 1>>,
}

impl<B: Backend> FrozenBatchNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            running_var: Param::from_tensor(Tensor::ones([channels], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.weight.val().dims();
        let scale = self.weight.val() / (self.running_var.val() + BN_EPSILON).sqrt();
        let shift = self.bias.val() - self.running_mean.val() * scale.clone();

        x * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }
}

/// Conv + BatchNorm（活性化は呼び出し側）
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: FrozenBatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    fn new(
        channels: [usize; 2],
        kernel_size: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel_size - 1) / 2;
        let conv = Conv2dConfig::new(channels, [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            norm: FrozenBatchNorm::new(channels[1], device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

fn relu6<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clamp(0.0, 6.0)
}

/// 逆残差ブロック（拡張 1x1 -> depthwise 3x3 -> 射影 1x1）
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    project: ConvNorm<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, expand_ratio: usize, device: &B::Device) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = if expand_ratio != 1 {
            Some(ConvNorm::new([in_channels, hidden], 1, 1, 1, device))
        } else {
            None
        };

        Self {
            expand,
            depthwise: ConvNorm::new([hidden, hidden], 3, stride, hidden, device),
            project: ConvNorm::new([hidden, out_channels], 1, 1, 1, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => relu6(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = relu6(self.depthwise.forward(x));
        let x = self.project.forward(x);

        // stride 1 かつ入出力チャネルが同じ場合のみ形状が一致する
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// バックボーン設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// 入力チャネル数
    #[config(default = 3)]
    pub channels: usize,
}

impl MobileNetV2Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let stem = ConvNorm::new([self.channels, STEM_CHANNELS], 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = STEM_CHANNELS;
        for (expand_ratio, out_channels, repeats, first_stride) in INVERTED_RESIDUAL_SETTINGS {
            for i in 0..repeats {
                let stride = if i == 0 { first_stride } else { 1 };
                blocks.push(InvertedResidual::new(in_channels, out_channels, stride, expand_ratio, device));
                in_channels = out_channels;
            }
        }

        let head = ConvNorm::new([in_channels, FEATURE_CHANNELS], 1, 1, 1, device);

        MobileNetV2 { stem, blocks, head }
    }
}

/// MobileNetV2（分類層なし）
///
/// 入力 [batch, 3, H, W] から特徴マップ [batch, 1280, H/32, W/32] を出力します。
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvNorm<B>,
    blocks: Vec<InvertedResidual<B>>,
    head: ConvNorm<B>,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu6(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        relu6(self.head.forward(x))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// 事前学習済みの重みを読み込む
    ///
    /// 拡張子で形式を選びます（`.safetensors` / `.pth` / それ以外はburnレコード）。
    /// ファイルが無い場合はランダム初期化のまま続行します。
    pub fn with_pretrained(self, weights_path: Option<&Path>, device: &B::Device) -> Result<Self> {
        let Some(path) = weights_path else {
            return Ok(self);
        };

        if !path.exists() {
            warn!(
                "事前学習済みの重みが見つかりません: {} (ランダム初期化で続行)",
                path.display()
            );
            return Ok(self);
        }

        match WeightsFormat::from_path(path) {
            WeightsFormat::BurnRecord => {
                let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
                let model = self
                    .load_file(path, &recorder, device)
                    .map_err(|e| anyhow::anyhow!("バックボーン重みの読み込みエラー: {:?}", e))?;
                info!("事前学習済みの重みを読み込みました: {}", path.display());
                Ok(model)
            }
            format => load_imagenet_weights(self, path, format),
        }
    }
}
