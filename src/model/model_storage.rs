//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズ、保存時の検証指標など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先パスを正規化（`.gz` で終わらなければ `.tar.gz` を付与）
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
///
/// 一時ファイルに書き出してから置き換えるため、
/// 書き込み途中で中断しても既存のチェックポイントは壊れません。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let temp_path = tar_gz_path.with_extension("gz.partial");
    let tar_gz_file = File::create(&temp_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", temp_path))?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tarアーカイブとgzipストリームを完成させる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?;
    encoder.finish().context("Failed to finish gzip stream")?;

    std::fs::rename(&temp_path, &tar_gz_path)
        .with_context(|| format!("Failed to move checkpoint into place: {:?}", tar_gz_path))?;

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let (metadata, _) = read_archive(tar_gz_path, true, false)?;
    metadata.ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    match read_archive(tar_gz_path, true, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

fn read_archive(
    tar_gz_path: &Path,
    want_metadata: bool,
    want_model: bool,
) -> Result<(Option<ModelMetadata>, Option<Vec<u8>>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata = None;
    let mut binary = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();

        match name.as_str() {
            METADATA_ENTRY if want_metadata => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY if want_model => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                binary = Some(buffer);
            }
            _ => {}
        }

        if (!want_metadata || metadata.is_some()) && (!want_model || binary.is_some()) {
            break;
        }
    }

    Ok((metadata, binary))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラス ({}): {}", metadata.num_classes(), metadata.class_names.join(", "));
    println!(
        "入力サイズ: {}x{}x{}",
        metadata.image_size, metadata.image_size, metadata.channels
    );
    println!("分類ヘッド: {} units, dropout={}", metadata.hidden_units, metadata.dropout);
    println!("保存エポック: {}", metadata.epoch);
    println!(
        "検証精度: {:.4}, 検証損失: {:.4}",
        metadata.valid_accuracy, metadata.valid_loss
    );
    println!("保存日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata::new(
            vec!["angry".into(), "happy".into(), "sad".into()],
            48,
            3,
            128,
            0.5,
            2,
            0.66,
            0.9,
        )
    }

    #[test]
    fn test_archive_path_appends_extension() {
        assert_eq!(
            archive_path(Path::new("models/emotion_best")),
            PathBuf::from("models/emotion_best.tar.gz")
        );
        assert_eq!(
            archive_path(Path::new("models/emotion_best.tar.gz")),
            PathBuf::from("models/emotion_best.tar.gz")
        );
    }

    #[test]
    fn test_save_and_load_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("emotion_best.tar.gz");
        let metadata = sample_metadata();
        let weights: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        let saved = save_model_with_metadata(&path, &metadata, &weights).unwrap();
        assert_eq!(saved, path);
        assert!(path.exists());
        assert!(!path.with_extension("gz.partial").exists());

        assert_eq!(load_metadata(&path).unwrap(), metadata);

        let (loaded_metadata, loaded_weights) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded_metadata.class_names, metadata.class_names);
        assert_eq!(loaded_weights, weights);
    }

    #[test]
    fn test_save_overwrites_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emotion_best.tar.gz");

        save_model_with_metadata(&path, &sample_metadata(), &[1, 2, 3]).unwrap();
        let mut newer = sample_metadata();
        newer.epoch = 5;
        save_model_with_metadata(&path, &newer, &[9, 9]).unwrap();

        let (metadata, weights) = load_model_with_metadata(&path).unwrap();
        assert_eq!(metadata.epoch, 5);
        assert_eq!(weights, vec![9, 9]);
    }

    #[test]
    fn test_missing_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_metadata(&dir.path().join("nothing.tar.gz")).is_err());
    }
}
