//! ImageNet事前学習済み重みの読み込み
//!
//! torchvision（`features.N...`）とtimm（`conv_stem` / `blocks.i.j...`）の
//! MobileNetV2重みを、このクレートのモジュール構造（`stem` / `blocks.k` / `head`）に
//! 名前を付け替えて読み込みます。`.safetensors` と `.pth`/`.pt` に対応し、
//! それ以外の拡張子はburnのバイナリレコードとして扱います。
//!
//! 分類層（`classifier.*`）や `num_batches_tracked` は対応先が無いため無視されます。

use anyhow::{bail, Result};
use burn::tensor::backend::Backend;
use burn_store::{ApplyResult, KeyRemapper, ModuleSnapshot, PytorchStore, SafetensorsStore};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::ml::backbone::{MobileNetV2, INVERTED_RESIDUAL_SETTINGS};

/// 重みファイルの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    Safetensors,
    PyTorch,
    BurnRecord,
}

impl WeightsFormat {
    /// 拡張子から判定
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "safetensors" => Self::Safetensors,
            "pth" | "pt" => Self::PyTorch,
            _ => Self::BurnRecord,
        }
    }
}

/// Conv+BN の組に対応する (元の接頭辞, 付け替え先の接頭辞)
fn conv_norm_pair(conv_from: String, norm_from: String, to: &str) -> [(String, String); 2] {
    [
        (conv_from, format!("{to}.conv.")),
        (norm_from, format!("{to}.norm.")),
    ]
}

/// 元の重み名から `blocks.k` への付け替え規則を作る
///
/// 正規表現は `^` で始まるため、付け替え後の名前が別の規則に再度一致することはありません。
pub fn pretrained_key_rules() -> Vec<(String, String)> {
    let mut rules = Vec::new();

    // torchvision
    rules.extend(conv_norm_pair(r"^features\.0\.0\.".into(), r"^features\.0\.1\.".into(), "stem"));
    // timm
    rules.extend(conv_norm_pair(r"^conv_stem\.".into(), r"^bn1\.".into(), "stem"));

    let mut k = 0;
    for (stage, (expand_ratio, _, repeats, _)) in INVERTED_RESIDUAL_SETTINGS.iter().enumerate() {
        for j in 0..*repeats {
            let tv = format!(r"^features\.{}\.conv\.", k + 1);
            let timm = format!(r"^blocks\.{stage}\.{j}\.");
            let block = format!("blocks.{k}");

            if *expand_ratio == 1 {
                rules.extend(conv_norm_pair(format!(r"{tv}0\.0\."), format!(r"{tv}0\.1\."), &format!("{block}.depthwise")));
                rules.extend(conv_norm_pair(format!(r"{tv}1\."), format!(r"{tv}2\."), &format!("{block}.project")));
                rules.extend(conv_norm_pair(format!(r"{timm}conv_dw\."), format!(r"{timm}bn1\."), &format!("{block}.depthwise")));
                rules.extend(conv_norm_pair(format!(r"{timm}conv_pw\."), format!(r"{timm}bn2\."), &format!("{block}.project")));
            } else {
                rules.extend(conv_norm_pair(format!(r"{tv}0\.0\."), format!(r"{tv}0\.1\."), &format!("{block}.expand")));
                rules.extend(conv_norm_pair(format!(r"{tv}1\.0\."), format!(r"{tv}1\.1\."), &format!("{block}.depthwise")));
                rules.extend(conv_norm_pair(format!(r"{tv}2\."), format!(r"{tv}3\."), &format!("{block}.project")));
                rules.extend(conv_norm_pair(format!(r"{timm}conv_pw\."), format!(r"{timm}bn1\."), &format!("{block}.expand")));
                rules.extend(conv_norm_pair(format!(r"{timm}conv_dw\."), format!(r"{timm}bn2\."), &format!("{block}.depthwise")));
                rules.extend(conv_norm_pair(format!(r"{timm}conv_pwl\."), format!(r"{timm}bn3\."), &format!("{block}.project")));
            }
            k += 1;
        }
    }

    let last = k + 1;
    rules.extend(conv_norm_pair(format!(r"^features\.{last}\.0\."), format!(r"^features\.{last}\.1\."), "head"));
    rules.extend(conv_norm_pair(r"^conv_head\.".into(), r"^bn2\.".into(), "head"));

    rules
}

fn key_remapper() -> Result<KeyRemapper> {
    KeyRemapper::from_patterns(pretrained_key_rules())
        .map_err(|e| anyhow::anyhow!("重み名の付け替え規則が不正です: {:?}", e))
}

/// 読み込み結果を確認してログに出す
fn report(result: &ApplyResult, path: &Path) -> Result<()> {
    if result.applied.is_empty() {
        bail!(
            "{} からバックボーンに対応する重みが1つも見つかりません",
            path.display()
        );
    }
    if !result.missing.is_empty() {
        warn!(
            "{} 個のパラメータはファイルに無いため初期値のままです (例: {})",
            result.missing.len(),
            result.missing[0]
        );
    }
    debug!("未使用の重み: {} 個", result.unused.len());
    info!(
        "事前学習済みの重みを読み込みました: {} ({} 個のテンソル)",
        path.display(),
        result.applied.len()
    );
    Ok(())
}

/// safetensors / PyTorch 形式の重みをバックボーンへ読み込む
pub fn load_imagenet_weights<B: Backend>(
    mut backbone: MobileNetV2<B>,
    path: &Path,
    format: WeightsFormat,
) -> Result<MobileNetV2<B>> {
    let remapper = key_remapper()?;
    let result = match format {
        WeightsFormat::Safetensors => {
            let mut store = SafetensorsStore::from_file(path)
                .remap(remapper)
                .allow_partial(true);
            backbone
                .load_from(&mut store)
                .map_err(|e| anyhow::anyhow!("safetensorsの読み込みエラー: {:?}", e))?
        }
        WeightsFormat::PyTorch => {
            let mut store = PytorchStore::from_file(path)
                .remap(remapper)
                .allow_partial(true);
            backbone
                .load_from(&mut store)
                .map_err(|e| anyhow::anyhow!("PyTorch重みの読み込みエラー: {:?}", e))?
        }
        WeightsFormat::BurnRecord => bail!("burnレコードは load_file で読み込んでください"),
    };

    report(&result, path)?;
    Ok(backbone)
}
