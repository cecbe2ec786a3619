//! 学習データの読み込み
//!
//! `data_dir/train/<class>/` と（任意で）`data_dir/test/<class>/` から画像を読み込み、
//! バッチ化できるデータセットを作ります。クラス名は `train` 配下のサブフォルダ名を
//! ソートしたものです。
//!
//! `test` が無い場合は、学習データの先頭 `validation_fraction` 分のバッチを検証用に回します。
//! 層化もランダム抽出もしない、ファイル順（シード付きシャッフル後）に依存した分割です。

use anyhow::{bail, Context, Result};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    tensor::{backend::Backend, Int, Tensor},
};
use burn_dataset::InMemDataset;
use image::imageops::{self, FilterType};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ml::ml_model::normalize_pixels;
use crate::model::DatasetSettings;

/// 読み込み対象の拡張子
pub const IMAGE_EXTENSIONS: [&str; 5] = ["bmp", "gif", "jpeg", "jpg", "png"];

/// データセットアイテム
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmotionItem {
    /// HWC順のRGB画素（image_size x image_size x 3）
    pub pixels: Vec<u8>,
    /// クラスID
    pub label: usize,
}

/// 画像を読み込み、RGB化して正方形にリサイズした画素列を返す
pub fn load_rgb_pixels(path: &Path, image_size: usize) -> Result<Vec<u8>> {
    let img = image::open(path)
        .with_context(|| format!("画像を読み込めません: {}", path.display()))?
        .to_rgb8();

    let size = image_size as u32;
    let img = if img.dimensions() == (size, size) {
        img
    } else {
        imageops::resize(&img, size, size, FilterType::Triangle)
    };

    Ok(img.into_raw())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn list_subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("フォルダを読めません: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    Ok(names)
}

/// `root/<class>/` 形式のフォルダから作る画像データセット（パスのみ保持）
pub struct ImageFolderDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    image_size: usize,
}

impl ImageFolderDataset {
    /// `class_names` の順でクラスIDを割り当てて走査する
    ///
    /// 語彙に無いサブフォルダは警告してスキップします。
    pub fn scan(root: &Path, class_names: &[String], image_size: usize) -> Result<Self> {
        for folder in list_subdirectories(root)? {
            if !class_names.contains(&folder) {
                warn!(
                    "学習データに無いクラスのためスキップ: {}",
                    root.join(&folder).display()
                );
            }
        }

        let mut samples = Vec::new();
        for (class_id, class_name) in class_names.iter().enumerate() {
            let class_dir = root.join(class_name);
            if !class_dir.is_dir() {
                continue;
            }

            let mut paths: Vec<PathBuf> = std::fs::read_dir(&class_dir)
                .with_context(|| format!("フォルダを読めません: {}", class_dir.display()))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && has_image_extension(path))
                .collect();
            paths.sort();
            samples.extend(paths.into_iter().map(|path| (path, class_id)));
        }

        Ok(Self { samples, image_size })
    }

    /// ファイル順をシード付きでシャッフル
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.samples.shuffle(&mut rng);
        self
    }

    /// クラスごとの枚数
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for (_, label) in &self.samples {
            if *label < num_classes {
                counts[*label] += 1;
            }
        }
        counts
    }

    /// 検出した画像ファイル数
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 全画像をデコードする
    ///
    /// 読み込めないファイルは警告してスキップします（ラベルだけ残すことはしない）。
    pub fn decode_all(&self) -> Vec<EmotionItem> {
        let mut items = Vec::with_capacity(self.samples.len());
        for (path, label) in &self.samples {
            match load_rgb_pixels(path, self.image_size) {
                Ok(pixels) => items.push(EmotionItem { pixels, label: *label }),
                Err(e) => warn!("画像読み込み失敗のためスキップ {}: {:#}", path.display(), e),
            }
        }

        let skipped = self.samples.len() - items.len();
        if skipped > 0 {
            warn!("{} 枚の画像を読み込めませんでした", skipped);
        }
        items
    }
}


/// メモリ上にキャッシュしたデータセットの一部範囲
///
/// 学習用と検証用で同じキャッシュを共有し、インデックス範囲だけを分けます。
#[derive(Clone)]
pub struct EmotionDataset {
    cache: Arc<InMemDataset<EmotionItem>>,
    start_idx: usize,
    end_idx: usize,
}

impl EmotionDataset {
    /// 全アイテムを一度だけデコードしてメモリに保持
    pub fn cache(source: &ImageFolderDataset) -> Self {
        Self::from_items(source.decode_all())
    }

    /// デコード済みアイテムから作る
    pub fn from_items(items: Vec<EmotionItem>) -> Self {
        let cache = InMemDataset::new(items);
        let len = cache.len();
        Self {
            cache: Arc::new(cache),
            start_idx: 0,
            end_idx: len,
        }
    }

    /// 先頭 `count` 件とそれ以降に分割
    pub fn split_prefix(self, count: usize) -> (Self, Self) {
        let boundary = (self.start_idx + count).min(self.end_idx);
        let head = Self {
            cache: self.cache.clone(),
            start_idx: self.start_idx,
            end_idx: boundary,
        };
        let tail = Self {
            cache: self.cache,
            start_idx: boundary,
            end_idx: self.end_idx,
        };
        (head, tail)
    }

    /// 元データ上のインデックス範囲
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start_idx..self.end_idx
    }
}

impl Dataset<EmotionItem> for EmotionDataset {
    fn get(&self, index: usize) -> Option<EmotionItem> {
        let actual_index = self.start_idx + index;
        if actual_index >= self.end_idx {
            return None;
        }
        self.cache.get(actual_index)
    }

    fn len(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

/// バッチャー
#[derive(Clone)]
pub struct EmotionBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    num_classes: usize,
}

impl<B: Backend> EmotionBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, num_classes: usize) -> Self {
        Self {
            device,
            image_size,
            num_classes,
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct EmotionBatch<B: Backend> {
    /// ImageNet正規化済み画像 [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// one-hotターゲット [batch_size, num_classes]
    pub targets: Tensor<B, 2>,
    /// クラスID [batch_size]
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, EmotionItem, EmotionBatch<B>> for EmotionBatcher<B> {
    fn batch(&self, items: Vec<EmotionItem>, _device: &B::Device) -> EmotionBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut labels = Vec::with_capacity(batch_size);

        for (row, item) in items.iter().enumerate() {
            all_pixels.extend(normalize_pixels(&item.pixels, size));
            if item.label < self.num_classes {
                one_hot[row * self.num_classes + item.label] = 1.0;
            }
            labels.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);
        let labels = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        EmotionBatch {
            images,
            targets,
            labels,
        }
    }
}

/// 1つの分割（学習用または検証用）
#[derive(Clone)]
pub struct EmotionSplit {
    pub dataset: EmotionDataset,
    pub batch_size: usize,
    /// エポックごとのシャッフル用シード（Noneならシャッフルしない）
    pub shuffle: Option<u64>,
    /// 先読みワーカー数
    pub num_workers: usize,
}

impl EmotionSplit {
    /// アイテム数
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// バッチ数（端数バッチを含む）
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size.max(1))
    }

    /// データローダーを構築
    pub fn into_loader<B: Backend>(
        self,
        device: B::Device,
        image_size: usize,
        num_classes: usize,
    ) -> Arc<dyn DataLoader<B, EmotionBatch<B>>> {
        let batcher = EmotionBatcher::<B>::new(device, image_size, num_classes);
        let mut builder = DataLoaderBuilder::new(batcher).batch_size(self.batch_size.max(1));
        if let Some(seed) = self.shuffle {
            builder = builder.shuffle(seed);
        }
        if self.num_workers > 0 {
            builder = builder.num_workers(self.num_workers);
        }
        builder.build(self.dataset)
    }
}

/// 学習用・検証用の分割とクラス名
#[derive(Clone)]
pub struct EmotionDatasets {
    pub train: EmotionSplit,
    pub valid: EmotionSplit,
    /// クラス名（クラスID順）
    pub class_names: Vec<String>,
}

/// 検証用に回す先頭バッチ数: floor(割合 × 全バッチ数)
pub fn validation_batch_count(total_items: usize, batch_size: usize, fraction: f64) -> usize {
    let total_batches = total_items.div_ceil(batch_size.max(1));
    (total_batches as f64 * fraction + 1e-9).floor() as usize
}

/// データディレクトリから学習用・検証用データセットを作る
///
/// `train` フォルダが無い場合は `Ok(None)` を返します。
pub fn load_emotion_datasets(settings: &DatasetSettings) -> Result<Option<EmotionDatasets>> {
    if settings.batch_size == 0 {
        bail!("バッチサイズは1以上が必要です");
    }

    let root = Path::new(&settings.data_dir);
    let train_dir = root.join("train");
    if !train_dir.is_dir() {
        warn!("学習データフォルダが見つかりません: {}", train_dir.display());
        return Ok(None);
    }

    let class_names = list_subdirectories(&train_dir)?;
    let train_source = ImageFolderDataset::scan(&train_dir, &class_names, settings.image_size)?
        .shuffled(settings.seed);
    info!(
        "{} 枚の画像を検出 ({} クラス: {})",
        train_source.len(),
        class_names.len(),
        class_names.join(", ")
    );
    for (name, count) in class_names.iter().zip(train_source.class_counts(class_names.len())) {
        info!("  {}: {} 枚", name, count);
    }

    let train_cache = EmotionDataset::cache(&train_source);

    let test_dir = root.join("test");
    let (train_dataset, valid_dataset) = if test_dir.is_dir() {
        let valid_source = ImageFolderDataset::scan(&test_dir, &class_names, settings.image_size)?;
        info!("検証データ: {} 枚 ({})", valid_source.len(), test_dir.display());
        (train_cache, EmotionDataset::cache(&valid_source))
    } else {
        let total = train_cache.len();
        let val_batches = validation_batch_count(total, settings.batch_size, settings.validation_fraction);
        info!(
            "test フォルダが無いため、先頭 {} / {} バッチを検証用に使用します",
            val_batches,
            total.div_ceil(settings.batch_size)
        );
        let (valid, train) = train_cache.split_prefix(val_batches * settings.batch_size);
        (train, valid)
    };

    Ok(Some(EmotionDatasets {
        train: EmotionSplit {
            dataset: train_dataset,
            batch_size: settings.batch_size,
            shuffle: Some(settings.seed),
            num_workers: settings.num_workers,
        },
        valid: EmotionSplit {
            dataset: valid_dataset,
            batch_size: settings.batch_size,
            shuffle: None,
            num_workers: settings.num_workers,
        },
        class_names,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn write_images(dir: &Path, count: usize, color: [u8; 3]) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            RgbImage::from_pixel(10, 10, Rgb(color))
                .save(dir.join(format!("img_{:03}.png", i)))
                .unwrap();
        }
    }

    fn settings_for(root: &Path, batch_size: usize) -> DatasetSettings {
        DatasetSettings {
            data_dir: root.to_string_lossy().to_string(),
            image_size: 8,
            batch_size,
            num_workers: 0,
            ..DatasetSettings::default()
        }
    }

    #[test]
    fn test_validation_batch_count_floors() {
        // 100枚 / 8 = 13バッチ -> 2.6 -> 2
        assert_eq!(validation_batch_count(100, 8, 0.2), 2);
        // 50枚 / 5 = 10バッチ -> 2
        assert_eq!(validation_batch_count(50, 5, 0.2), 2);
        assert_eq!(validation_batch_count(0, 32, 0.2), 0);
        assert_eq!(validation_batch_count(10, 32, 0.2), 0);
    }

    #[test]
    fn test_missing_train_folder_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        write_images(&dir.path().join("test/happy"), 2, [1, 2, 3]);
        assert!(load_emotion_datasets(&settings_for(dir.path(), 4)).unwrap().is_none());
    }

    #[test]
    fn test_train_only_takes_prefix_batches_for_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_images(&dir.path().join("train/sad"), 30, [0, 0, 200]);
        write_images(&dir.path().join("train/happy"), 20, [200, 200, 0]);

        let datasets = load_emotion_datasets(&settings_for(dir.path(), 5)).unwrap().unwrap();
        assert_eq!(datasets.class_names, vec!["happy", "sad"]);

        // 50枚 / 5 = 10バッチ -> 検証2バッチ、学習8バッチ
        assert_eq!(datasets.valid.num_batches(), 2);
        assert_eq!(datasets.train.num_batches(), 8);
        assert_eq!(datasets.valid.len() + datasets.train.len(), 50);

        // 検証は先頭、学習はその直後から（重複なし）
        assert_eq!(datasets.valid.dataset.range(), 0..10);
        assert_eq!(datasets.train.dataset.range(), 10..50);
        assert!(datasets.valid.shuffle.is_none());
        assert!(datasets.train.shuffle.is_some());
    }

    #[test]
    fn test_test_folder_is_mapped_onto_train_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        write_images(&dir.path().join("train/angry"), 3, [255, 0, 0]);
        write_images(&dir.path().join("train/happy"), 3, [0, 255, 0]);
        write_images(&dir.path().join("test/happy"), 2, [0, 255, 0]);
        write_images(&dir.path().join("test/surprised"), 2, [0, 0, 255]);

        let datasets = load_emotion_datasets(&settings_for(dir.path(), 4)).unwrap().unwrap();
        assert_eq!(datasets.train.len(), 6);
        assert_eq!(datasets.valid.len(), 2);
        for i in 0..datasets.valid.len() {
            let item = datasets.valid.dataset.get(i).unwrap();
            assert_eq!(item.label, 1);
            assert_eq!(item.pixels.len(), 8 * 8 * 3);
        }
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let class_dir = dir.path().join("train/happy");
        write_images(&class_dir, 3, [200, 200, 0]);
        std::fs::write(class_dir.join("fake.jpg"), b"").unwrap();

        let source = ImageFolderDataset::scan(&dir.path().join("train"), &["happy".to_string()], 8).unwrap();
        assert_eq!(source.len(), 4);

        let cached = EmotionDataset::cache(&source);
        assert_eq!(cached.len(), 3);
        for i in 0..cached.len() {
            let item = cached.get(i).unwrap();
            assert_eq!(item.label, 0);
            // 黒画像で置き換えていないこと
            assert!(item.pixels.iter().any(|&p| p != 0));
        }
    }

    #[test]
    fn test_prefix_split_counts_only_decodable_images() {
        let dir = tempfile::tempdir().unwrap();
        let class_dir = dir.path().join("train/sad");
        write_images(&class_dir, 10, [0, 0, 200]);
        std::fs::write(class_dir.join("broken.png"), b"not an image").unwrap();

        // 読めない1枚を除いて10枚 / 5 = 2バッチ、割合0.5で検証1バッチ
        let mut settings = settings_for(dir.path(), 5);
        settings.validation_fraction = 0.5;
        let datasets = load_emotion_datasets(&settings).unwrap().unwrap();
        assert_eq!(datasets.valid.len(), 5);
        assert_eq!(datasets.train.len(), 5);
    }

    #[test]
    fn test_batcher_builds_one_hot_targets() {
        let device = Default::default();
        let batcher = EmotionBatcher::<TestBackend>::new(device, 2, 3);
        let items = vec![
            EmotionItem { pixels: vec![255; 12], label: 2 },
            EmotionItem { pixels: vec![0; 12], label: 0 },
        ];

        let batch = batcher.batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(
            batch.targets.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]
        );
        assert_eq!(batch.labels.dims(), [2]);
    }

    #[test]
    fn test_loader_yields_every_item_once_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_images(&dir.path().join("train/happy"), 7, [10, 20, 30]);
        write_images(&dir.path().join("test/happy"), 3, [10, 20, 30]);

        let datasets = load_emotion_datasets(&settings_for(dir.path(), 3)).unwrap().unwrap();
        let loader = datasets.train.into_loader::<TestBackend>(Default::default(), 8, 1);

        let sizes: Vec<usize> = loader.iter().map(|batch| batch.images.dims()[0]).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert_eq!(sizes.len(), 3);
    }
}
