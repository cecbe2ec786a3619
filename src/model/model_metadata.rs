//! モデルメタデータの定義
//!
//! チェックポイント（tar.gz）にモデルの重みと一緒に保存され、
//! 推論時にモデル構造とクラス名を復元するために使用します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// クラス名（出力層のインデックス順）
    /// 例: ["angry", "happy", "neutral", "sad"]
    pub class_names: Vec<String>,

    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: usize,

    /// 入力チャネル数
    pub channels: usize,

    /// 分類ヘッドの中間層ユニット数
    pub hidden_units: usize,

    /// ドロップアウト率
    pub dropout: f64,

    /// 保存時点のエポック（1始まり）
    pub epoch: usize,

    /// 保存時点の検証精度
    pub valid_accuracy: f64,

    /// 保存時点の検証損失
    pub valid_loss: f64,

    /// モデルの保存時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        image_size: usize,
        channels: usize,
        hidden_units: usize,
        dropout: f64,
        epoch: usize,
        valid_accuracy: f64,
        valid_loss: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names,
            image_size,
            channels,
            hidden_units,
            dropout,
            epoch,
            valid_accuracy,
            valid_loss,
            trained_at,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_name(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(|s| s.as_str())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
