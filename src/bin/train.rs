//! 学習: dataset/{train,test}/<class>/ -> models/emotion_best.tar.gz

#![recursion_limit = "256"]

use aura_emotion_lib::logging::init_logging;
use aura_emotion_lib::ml::{train_engine, TrainingOutcome};
use aura_emotion_lib::model::{AppConfig, DeviceType};
use burn::tensor::backend::Backend;
use burn_autodiff::Autodiff;
use tracing::{error, info};

/// 結果を表示し、終了コードを返す
fn report<B: Backend>(outcome: anyhow::Result<TrainingOutcome<B>>) -> i32 {
    match outcome {
        Ok(TrainingOutcome::NoData) => {
            info!("学習データが無いため終了します");
        }
        Ok(TrainingOutcome::Completed {
            model,
            history,
            checkpoint_saves,
            stopped_epoch,
            checkpoint_path,
            ..
        }) => {
            if let Some(best) = history.best_by_accuracy() {
                println!(
                    "最良エポック: {} (val_accuracy={:.4}, val_loss={:.4})",
                    best.epoch, best.valid_accuracy, best.valid_loss
                );
            }
            if let Some(epoch) = stopped_epoch {
                println!("早期終了: エポック {}", epoch);
            }
            if checkpoint_saves > 0 {
                println!(
                    "チェックポイント: {} ({} クラス)",
                    checkpoint_path.display(),
                    model.num_classes()
                );
            }
        }
        Ok(TrainingOutcome::Failed(message)) => {
            error!("学習に失敗しました: {}", message);
        }
        Err(e) => {
            error!("[ERROR] {:#}", e);
            return 1;
        }
    }
    0
}

fn main() {
    init_logging();

    let config = AppConfig::load_or_default();
    config.display();

    let code = match config.device_type {
        DeviceType::Wgpu => {
            let device = burn_wgpu::WgpuDevice::default();
            info!("計算デバイス: {} ({:?})", config.device_type, device);
            report(train_engine::<Autodiff<burn_wgpu::Wgpu>>(&config, &device))
        }
        DeviceType::Cpu => {
            let device = burn_ndarray::NdArrayDevice::default();
            info!("計算デバイス: {}", config.device_type);
            report(train_engine::<Autodiff<burn_ndarray::NdArray<f32>>>(&config, &device))
        }
    };
    std::process::exit(code);
}
