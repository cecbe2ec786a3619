//! パイプライン設定管理モジュール
//!
//! 前処理・データ読み込み・モデル・学習の各設定をJSON形式で保存・読み込みします。
//! 各ステージは必要な設定構造体を引数として受け取り、グローバル状態は持ちません。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 監視対象のエポック指標
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredMetric {
    /// 検証損失（小さいほど良い）
    ValidLoss,
    /// 検証精度（大きいほど良い）
    ValidAccuracy,
}

impl std::fmt::Display for MonitoredMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitoredMetric::ValidLoss => write!(f, "val_loss"),
            MonitoredMetric::ValidAccuracy => write!(f, "val_accuracy"),
        }
    }
}

impl MonitoredMetric {
    /// 大きいほど良い指標か
    pub fn higher_is_better(&self) -> bool {
        matches!(self, MonitoredMetric::ValidAccuracy)
    }

    /// 最良値の初期値（どんな有限値でも改善になる）
    pub fn initial_best(&self) -> f64 {
        if self.higher_is_better() {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }
    }

    /// `value` が `best` より厳密に良いか（NaNは改善とみなさない）
    pub fn is_improvement(&self, value: f64, best: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        if self.higher_is_better() {
            value > best
        } else {
            value < best
        }
    }
}

/// 前処理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// 元画像のルート（感情ごとのサブフォルダを含む）
    pub raw_data_dir: String,
    /// 前処理済み画像の出力先
    pub output_dir: String,
    /// 出力画像サイズ（正方形、ピクセル）
    pub image_size: u32,
    /// 感情ラベル（この順序がラベルIDになる）
    pub emotions: Vec<String>,
    /// 検証データの割合
    pub val_ratio: f64,
    /// テストデータの割合
    pub test_ratio: f64,
    /// 分割用ランダムシード
    pub seed: u64,
    /// 出力画像形式 ("jpg" / "png")
    pub image_format: String,
    /// JPEG品質 (1-100)
    pub jpeg_quality: u8,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            raw_data_dir: "data_raw".to_string(),
            output_dir: "data_processed".to_string(),
            image_size: 96,
            emotions: ["angry", "happy", "sad", "neutral"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            val_ratio: 0.15,
            test_ratio: 0.15,
            seed: 42,
            image_format: "jpg".to_string(),
            jpeg_quality: 95,
        }
    }
}

/// データセット読み込み設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// `train/` と（任意で）`test/` を含むディレクトリ
    pub data_dir: String,
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ファイル順シャッフル用シード
    pub seed: u64,
    /// `test/` が無い場合に検証用に回す先頭バッチの割合
    pub validation_fraction: f64,
    /// 先読みワーカー数（0でメインスレッドのみ）
    pub num_workers: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            data_dir: "dataset".to_string(),
            image_size: 48,
            batch_size: 32,
            seed: 123,
            validation_fraction: 0.2,
            num_workers: 2,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 分類ヘッドの中間層ユニット数
    pub hidden_units: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 入力チャネル数（事前学習済み特徴抽出器は3を要求）
    pub channels: usize,
    /// クラス一覧が空の場合に使うクラス数
    pub fallback_num_classes: usize,
    /// 事前学習済みバックボーンの重み（`.safetensors` / `.pth` / burnのバイナリレコード）
    pub pretrained_weights: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_units: 128,
            dropout: 0.5,
            channels: 3,
            fallback_num_classes: 7,
            pretrained_weights: Some("models/mobilenet_v2_1_0_imagenet.safetensors".to_string()),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ベストモデルの保存先
    pub checkpoint_path: String,
    /// チェックポイント保存の判定指標
    pub checkpoint_monitor: MonitoredMetric,
    /// 早期終了の判定指標
    pub early_stopping_monitor: MonitoredMetric,
    /// 改善なしで許容するエポック数
    pub early_stopping_patience: usize,
    /// 早期終了時にベストの重みへ戻すか
    pub restore_best_weights: bool,
    /// 学習履歴CSVの保存先
    pub history_path: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            learning_rate: 1e-3,
            checkpoint_path: "models/emotion_best.tar.gz".to_string(),
            checkpoint_monitor: MonitoredMetric::ValidAccuracy,
            early_stopping_monitor: MonitoredMetric::ValidLoss,
            early_stopping_patience: 3,
            restore_best_weights: true,
            history_path: Some("models/history.csv".to_string()),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 前処理設定
    #[serde(default)]
    pub preprocess: PreprocessSettings,
    /// データセット設定
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}",
                        path.display(),
                        e
                    );
                    warn!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== パイプライン設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("\n--- 前処理設定 ---");
        println!("入力: {} -> 出力: {}", self.preprocess.raw_data_dir, self.preprocess.output_dir);
        println!("画像サイズ: {}x{}", self.preprocess.image_size, self.preprocess.image_size);
        println!("感情ラベル: {}", self.preprocess.emotions.join(", "));
        println!(
            "分割比率: train {:.2} / val {:.2} / test {:.2}",
            1.0 - self.preprocess.val_ratio - self.preprocess.test_ratio,
            self.preprocess.val_ratio,
            self.preprocess.test_ratio
        );
        println!("\n--- データセット設定 ---");
        println!("データディレクトリ: {}", self.dataset.data_dir);
        println!("入力サイズ: {}x{}", self.dataset.image_size, self.dataset.image_size);
        println!("バッチサイズ: {}", self.dataset.batch_size);
        println!("\n--- モデル設定 ---");
        println!("中間層ユニット数: {}", self.model.hidden_units);
        println!("ドロップアウト率: {}", self.model.dropout);
        if let Some(ref weights) = self.model.pretrained_weights {
            println!("事前学習済み重み: {}", weights);
        }
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("学習率: {}", self.training.learning_rate);
        println!(
            "チェックポイント: {} ({} が改善した時のみ保存)",
            self.training.checkpoint_path, self.training.checkpoint_monitor
        );
        println!(
            "早期終了: {} が {} エポック改善しなければ停止",
            self.training.early_stopping_monitor, self.training.early_stopping_patience
        );
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.preprocess.image_size, 96);
        assert_eq!(config.preprocess.emotions, vec!["angry", "happy", "sad", "neutral"]);
        assert_eq!(config.dataset.image_size, 48);
        assert_eq!(config.dataset.batch_size, 32);
        assert_eq!(config.model.fallback_num_classes, 7);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.training.early_stopping_patience, 3);
        assert_eq!(config.training.checkpoint_monitor, MonitoredMetric::ValidAccuracy);
        assert_eq!(config.training.early_stopping_monitor, MonitoredMetric::ValidLoss);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.dataset.data_dir, deserialized.dataset.data_dir);
        assert_eq!(config.training.checkpoint_path, deserialized.training.checkpoint_path);
    }

    #[test]
    fn test_partial_config_uses_section_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{ "device_type": "Cpu" }"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.preprocess.seed, 42);
    }

    #[test]
    fn test_partial_section_keeps_given_keys() {
        let json = r#"{"device_type":"Cpu","dataset":{"data_dir":"my_faces"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.dataset.data_dir, "my_faces");
        assert_eq!(config.dataset.image_size, 48);
        assert_eq!(config.dataset.batch_size, 32);
        assert_eq!(config.dataset.seed, 123);

        // 省略したキーはセクションごとのデフォルト
        let config: AppConfig =
            serde_json::from_str(r#"{"training":{"num_epochs":3},"model":{"pretrained_weights":null}}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.early_stopping_patience, 3);
        assert_eq!(config.model.pretrained_weights, None);
        assert_eq!(config.model.hidden_units, 128);
    }

    #[test]
    fn test_partial_section_file_is_not_replaced_by_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"device_type":"Cpu","dataset":{"data_dir":"my_faces"}}"#).unwrap();

        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.dataset.data_dir, "my_faces");
        assert_eq!(config.preprocess.jpeg_quality, 95);
    }

    #[test]
    fn test_monitored_metric_serde_names() {
        let json = serde_json::to_string(&MonitoredMetric::ValidAccuracy).unwrap();
        assert_eq!(json, "\"valid_accuracy\"");
        assert_eq!(format!("{}", MonitoredMetric::ValidLoss), "val_loss");
    }

    #[test]
    fn test_load_or_default_falls_back_on_missing_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(AppConfig::load_or_default_from(&missing).dataset.batch_size, 32);

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert_eq!(AppConfig::load_or_default_from(&broken).dataset.batch_size, 32);

        let mut config = AppConfig::default();
        config.dataset.batch_size = 8;
        let saved = dir.path().join("config.json");
        config.save(&saved).unwrap();
        assert_eq!(AppConfig::load_or_default_from(&saved).dataset.batch_size, 8);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
