//! 前処理モジュール
//!
//! `raw_data_dir/<emotion>/` の元画像を読み込み、層化分割して
//! `output_dir/{train,val,test}/<emotion>/` に書き出します。

pub mod loader;
pub mod splitter;
pub mod writer;

pub use loader::{load_images_and_labels, prepare_image, LabeledImages, SUPPORTED_EXTENSIONS};
pub use splitter::{split_train_val_test, stratified_split, SplitIndices};
pub use writer::{create_output_dirs, save_split, SPLIT_NAMES};

use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

use crate::model::PreprocessSettings;

/// 前処理の結果（分割ごとの保存枚数）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl PreprocessSummary {
    pub fn total(&self) -> usize {
        self.train + self.val + self.test
    }
}

/// 前処理パイプライン全体を実行
///
/// 画像が1枚も見つからない場合のみエラーを返します。
pub fn run_preprocessing(settings: &PreprocessSettings) -> Result<PreprocessSummary> {
    info!("元データ: {}", settings.raw_data_dir);
    create_output_dirs(settings)?;

    info!("画像を読み込み中...");
    let loaded = load_images_and_labels(settings)?;
    if loaded.is_empty() {
        bail!(
            "画像が見つかりません: {} 配下の感情フォルダを確認してください",
            settings.raw_data_dir
        );
    }

    for (emotion, count) in settings
        .emotions
        .iter()
        .zip(loaded.class_counts(settings.emotions.len()))
    {
        info!("  {}: {} 枚", emotion, count);
    }

    let split = split_train_val_test(
        &loaded.labels,
        settings.val_ratio,
        settings.test_ratio,
        settings.seed,
    );
    info!(
        "分割: train {} / val {} / test {}",
        split.train.len(),
        split.val.len(),
        split.test.len()
    );

    let summary = PreprocessSummary {
        train: save_split(&loaded.images, &loaded.labels, &split.train, "train", settings)?,
        val: save_split(&loaded.images, &loaded.labels, &split.val, "val", settings)?,
        test: save_split(&loaded.images, &loaded.labels, &split.test, "test", settings)?,
    };

    let output_dir = Path::new(&settings.output_dir);
    let absolute = std::fs::canonicalize(output_dir).unwrap_or_else(|_| output_dir.to_path_buf());
    info!("[完了] 前処理が終了しました: {} 枚を保存", summary.total());
    info!("出力先: {}", absolute.display());

    Ok(summary)
}
