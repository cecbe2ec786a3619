//! ログ初期化

use tracing_subscriber::{fmt, EnvFilter};

/// tracingのサブスクライバを初期化（`RUST_LOG` が無ければ info）
///
/// 2回目以降の呼び出しは何もしません。
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!("ログ初期化テスト");
    }
}
