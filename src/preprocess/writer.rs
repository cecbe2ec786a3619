//! 分割済み画像の書き出し
//!
//! `output_dir/<split>/<emotion>/<emotion>_<乱数>.<ext>` に保存します。

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb32FImage, RgbImage};
use rand::Rng;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::model::PreprocessSettings;

/// 出力する分割名
pub const SPLIT_NAMES: [&str; 3] = ["train", "val", "test"];

/// ファイル名に使う乱数の上限
const FILENAME_RANGE: u32 = 1_000_000;

/// 出力フォルダを作成する
///
/// output_dir/train/<emotion>/, output_dir/val/<emotion>/, output_dir/test/<emotion>/
pub fn create_output_dirs(settings: &PreprocessSettings) -> Result<()> {
    let output_dir = Path::new(&settings.output_dir);
    for split in SPLIT_NAMES {
        for emotion in &settings.emotions {
            let path = output_dir.join(split).join(emotion);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("出力フォルダを作成できません: {}", path.display()))?;
        }
    }
    info!("出力フォルダを作成しました（既存の場合はそのまま）");
    Ok(())
}

/// [0, 1] のf32画像を8bitに戻す
pub fn to_rgb8(img: &Rgb32FImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let raw: Vec<u8> = img
        .as_raw()
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    // 寸法とバッファ長は元画像と同じなので失敗しない
    RgbImage::from_raw(width, height, raw).unwrap_or_else(|| RgbImage::new(width, height))
}

/// 既存ファイルと衝突しない `<emotion>_<乱数>.<ext>` を選ぶ
pub fn unique_output_path<R: Rng>(dir: &Path, emotion: &str, extension: &str, rng: &mut R) -> PathBuf {
    loop {
        let filename = format!("{}_{}.{}", emotion, rng.gen_range(0..FILENAME_RANGE), extension);
        let path = dir.join(filename);
        if !path.exists() {
            return path;
        }
    }
}

/// 1枚の画像を設定の形式で保存
pub fn write_image(img: &Rgb32FImage, path: &Path, settings: &PreprocessSettings) -> Result<()> {
    let rgb = to_rgb8(img);
    let format = settings.image_format.to_lowercase();

    if format == "jpg" || format == "jpeg" {
        let file = File::create(path)
            .with_context(|| format!("ファイルを作成できません: {}", path.display()))?;
        let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), settings.jpeg_quality);
        rgb.write_with_encoder(encoder)
            .with_context(|| format!("JPEGの書き込みに失敗: {}", path.display()))?;
    } else {
        rgb.save(path)
            .with_context(|| format!("画像の書き込みに失敗: {}", path.display()))?;
    }
    Ok(())
}

/// 1つの分割を保存し、保存した枚数を返す
///
/// `indices` は `images` / `labels` へのインデックス。
/// 書き込みに失敗した画像は警告してスキップし、残りの保存を続けます。
pub fn save_split(
    images: &[Rgb32FImage],
    labels: &[usize],
    indices: &[usize],
    split_name: &str,
    settings: &PreprocessSettings,
) -> Result<usize> {
    if indices.is_empty() {
        warn!("保存するデータがありません: {}", split_name);
        return Ok(0);
    }

    let mut rng = rand::thread_rng();
    let extension = match settings.image_format.to_lowercase().as_str() {
        "jpeg" => "jpg".to_string(),
        other => other.to_string(),
    };
    let mut written = 0;

    for &idx in indices {
        let emotion = &settings.emotions[labels[idx]];
        let out_dir = Path::new(&settings.output_dir).join(split_name).join(emotion);
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("出力フォルダを作成できません: {}", out_dir.display()))?;

        let out_path = unique_output_path(&out_dir, emotion, &extension, &mut rng);
        if let Err(e) = write_image(&images[idx], &out_path, settings) {
            warn!("画像を保存できないためスキップ: {:#}", e);
            // 書きかけのファイルを残さない
            let _ = std::fs::remove_file(&out_path);
            continue;
        }
        written += 1;
    }

    if written < indices.len() {
        warn!("{}: {} / {} 枚を保存しました", split_name, written, indices.len());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image(size: u32) -> Rgb32FImage {
        Rgb32FImage::from_fn(size, size, |x, y| {
            Rgb([
                (x * 16 % 256) as f32 / 255.0,
                (y * 16 % 256) as f32 / 255.0,
                ((x + y) * 8 % 256) as f32 / 255.0,
            ])
        })
    }

    #[test]
    fn test_to_rgb8_rounds_and_clamps() {
        let img = Rgb32FImage::from_pixel(1, 1, Rgb([1.5, -0.2, 0.5]));
        let rgb = to_rgb8(&img);
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 0, 128]);
    }

    #[test]
    fn test_png_round_trip_is_exact_within_quantization() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PreprocessSettings {
            image_format: "png".to_string(),
            ..PreprocessSettings::default()
        };
        let original = gradient_image(12);
        let path = dir.path().join("face.png");
        write_image(&original, &path, &settings).unwrap();

        let reread = image::open(&path).unwrap().to_rgb32f();
        for (a, b) in original.as_raw().iter().zip(reread.as_raw()) {
            assert!((a - b).abs() <= 0.5 / 255.0 + 1e-6);
        }
    }

    #[test]
    fn test_jpeg_round_trip_is_close() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PreprocessSettings::default();
        let original = Rgb32FImage::from_pixel(16, 16, Rgb([0.4, 0.6, 0.2]));
        let path = dir.path().join("face.jpg");
        write_image(&original, &path, &settings).unwrap();

        let reread = image::open(&path).unwrap().to_rgb32f();
        assert_eq!(reread.dimensions(), (16, 16));
        for (a, b) in original.as_raw().iter().zip(reread.as_raw()) {
            assert!((a - b).abs() < 0.05);
        }
    }

    #[test]
    fn test_unique_output_path_skips_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut first_rng = StdRng::seed_from_u64(1);
        let first = unique_output_path(dir.path(), "happy", "jpg", &mut first_rng);
        std::fs::write(&first, b"taken").unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let second = unique_output_path(dir.path(), "happy", "jpg", &mut rng);
        assert_ne!(first, second);
        let name = second.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("happy_") && name.ends_with(".jpg"));
    }

    #[test]
    fn test_save_split_writes_into_label_folders() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PreprocessSettings {
            output_dir: dir.path().to_string_lossy().to_string(),
            emotions: vec!["happy".into(), "sad".into()],
            image_format: "png".to_string(),
            ..PreprocessSettings::default()
        };
        let images = vec![gradient_image(4), gradient_image(4), gradient_image(4)];
        let labels = vec![0, 1, 1];

        let written = save_split(&images, &labels, &[0, 2], "val", &settings).unwrap();
        assert_eq!(written, 2);
        let happy = std::fs::read_dir(dir.path().join("val/happy")).unwrap().count();
        let sad = std::fs::read_dir(dir.path().join("val/sad")).unwrap().count();
        assert_eq!((happy, sad), (1, 1));

        assert_eq!(save_split(&images, &labels, &[], "test", &settings).unwrap(), 0);
    }

    #[test]
    fn test_save_split_skips_images_that_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PreprocessSettings {
            output_dir: dir.path().to_string_lossy().to_string(),
            emotions: vec!["happy".into()],
            image_format: "bogus".to_string(),
            ..PreprocessSettings::default()
        };
        let images = vec![gradient_image(4), gradient_image(4)];
        let labels = vec![0, 0];

        let written = save_split(&images, &labels, &[0, 1], "train", &settings).unwrap();
        assert_eq!(written, 0);
        let leftovers = std::fs::read_dir(dir.path().join("train/happy")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
