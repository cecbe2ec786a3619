//! 前処理: data_raw/<emotion>/ -> data_processed/{train,val,test}/<emotion>/

use aura_emotion_lib::logging::init_logging;
use aura_emotion_lib::model::AppConfig;
use aura_emotion_lib::preprocess::run_preprocessing;
use tracing::{error, info, warn};

fn main() {
    init_logging();

    let config = AppConfig::load_or_default();

    // 後続の train / predict が同じ設定を使えるよう、初回はデフォルト設定を書き出す
    let config_path = AppConfig::default_path();
    if !config_path.exists() {
        match config.save(&config_path) {
            Ok(()) => info!("設定ファイルを作成しました: {}", config_path.display()),
            Err(e) => warn!("設定ファイルを作成できません ({}): {:#}", config_path.display(), e),
        }
    }

    if let Err(e) = run_preprocessing(&config.preprocess) {
        error!("[ERROR] {:#}", e);
        std::process::exit(1);
    }
}
