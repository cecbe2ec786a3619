//! 表情画像による感情認識の学習パイプライン
//!
//! - `preprocess`: 元画像の正規化・層化分割・書き出し
//! - `ml`: データ読み込み、転移学習モデル、学習ループ、推論
//! - `model`: 設定とチェックポイント（tar.gz）の保存・読み込み

pub mod logging;
pub mod model;
pub mod preprocess;
#[cfg(feature = "ml")]
pub mod ml;
