//! 元画像の読み込みと正規化
//!
//! `raw_data_dir/<emotion>/` 配下の画像を読み込み、RGB化・リサイズ・[0, 1] への
//! スケーリングを行って、画像とラベルの並列配列を作ります。

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb32FImage};
use std::path::Path;
use tracing::{info, warn};

use crate::model::PreprocessSettings;

/// 前処理で受け付ける拡張子
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 読み込み済みの画像とラベル（同じインデックスが1サンプル）
#[derive(Debug, Default)]
pub struct LabeledImages {
    /// [0, 1] にスケーリングされたRGB画像
    pub images: Vec<Rgb32FImage>,
    /// `emotions` へのインデックス
    pub labels: Vec<usize>,
}

impl LabeledImages {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// ラベルごとの枚数
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &label in &self.labels {
            if label < num_classes {
                counts[label] += 1;
            }
        }
        counts
    }
}

/// 対応拡張子かどうか（大文字小文字は区別しない）
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// 1枚の画像を読み込んで正方形にリサイズし、[0, 1] にスケーリング
pub fn prepare_image(path: &Path, image_size: u32) -> Result<Rgb32FImage> {
    let img = image::open(path)
        .with_context(|| format!("画像を読み込めません: {}", path.display()))?;

    // チャネル順をRGBに揃える（グレースケールやRGBAもここで3チャネルになる）
    let rgb = img.to_rgb8();
    let resized = imageops::resize(&rgb, image_size, image_size, FilterType::Triangle);

    Ok(DynamicImage::ImageRgb8(resized).to_rgb32f())
}

/// 感情フォルダごとに画像を読み込む
///
/// - フォルダが無いクラスは警告してスキップ
/// - 読み込めないファイルは警告してスキップ（処理全体は止めない）
pub fn load_images_and_labels(settings: &PreprocessSettings) -> Result<LabeledImages> {
    let raw_dir = Path::new(&settings.raw_data_dir);
    let mut loaded = LabeledImages::default();

    for (label, emotion) in settings.emotions.iter().enumerate() {
        let folder = raw_dir.join(emotion);
        if !folder.is_dir() {
            warn!("フォルダが見つかりません: {}", folder.display());
            continue;
        }

        info!("クラス '{}' の画像を読み込み中...", emotion);

        let mut paths: Vec<_> = std::fs::read_dir(&folder)
            .with_context(|| format!("フォルダを読めません: {}", folder.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_supported_extension(path))
            .collect();
        paths.sort();

        let mut class_count = 0;
        for path in paths {
            match prepare_image(&path, settings.image_size) {
                Ok(img) => {
                    loaded.images.push(img);
                    loaded.labels.push(label);
                    class_count += 1;
                }
                Err(e) => {
                    warn!("読み込み失敗 {}: {:#}", path.display(), e);
                }
            }
        }

        info!("  クラス '{}': {} 枚", emotion, class_count);
    }

    info!("合計 {} 枚の画像を読み込みました", loaded.len());
    Ok(loaded)
}
