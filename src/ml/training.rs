//! モデル学習
//!
//! エポックループ（学習 + 検証）と、データ読み込みからチェックポイント保存までを
//! まとめた学習ドライバを提供します。

use anyhow::Result;
use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
    train::{ClassificationOutput, TrainStep, ValidStep},
};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::ml::callbacks::{BestCheckpoint, Control, EarlyStopping, EpochObserver, EpochSummary};
use crate::ml::checkpoint::save_checkpoint;
use crate::ml::dataset::{load_emotion_datasets, EmotionSplit};
use crate::ml::history::TrainingHistory;
use crate::ml::ml_model::{EmotionClassifier, ModelConfig};
use crate::model::{AppConfig, ModelMetadata, TrainingSettings};

/// 学習ドライバの結果
#[derive(Debug)]
pub enum TrainingOutcome<B: Backend> {
    /// `train` フォルダが無く、何もしなかった
    NoData,
    /// 学習が最後まで（または早期終了で）完了した
    Completed {
        /// 学習済みモデル（早期終了時は最良エポックの重み）
        model: EmotionClassifier<B>,
        class_names: Vec<String>,
        history: TrainingHistory,
        /// チェックポイントを保存した回数
        checkpoint_saves: usize,
        /// 早期終了したエポック
        stopped_epoch: Option<usize>,
        checkpoint_path: PathBuf,
    },
    /// 学習中のエラー（パニックを含む）
    Failed(String),
}

/// 1バッチ分の (損失, 正解数, サンプル数)
fn batch_stats<B: Backend>(item: &ClassificationOutput<B>) -> (f64, usize, usize) {
    let [batch_size, _] = item.output.dims();
    let loss = item.loss.clone().into_scalar().elem::<f64>();
    let correct = item
        .output
        .clone()
        .argmax(1)
        .flatten::<1>(0, 1)
        .equal(item.targets.clone())
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();

    (loss, correct as usize, batch_size)
}

/// サンプル数で重み付けした損失と精度の集計
#[derive(Debug, Default)]
struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningMetrics {
    fn update(&mut self, (loss, correct, samples): (f64, usize, usize)) {
        self.loss_sum += loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
    }

    /// データが無い場合はNaN
    fn loss(&self) -> f64 {
        if self.samples > 0 {
            self.loss_sum / self.samples as f64
        } else {
            f64::NAN
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples > 0 {
            self.correct as f64 / self.samples as f64
        } else {
            f64::NAN
        }
    }
}

/// 学習ループ
///
/// 各エポックで学習データを1周して分類ヘッドを更新し、検証データで損失と精度を測ります。
/// エポック終了ごとに `observers` を順に呼び、いずれかが `Stop` を返したら終了します。
#[allow(clippy::too_many_arguments)]
pub fn fit<B: AutodiffBackend>(
    mut model: EmotionClassifier<B>,
    train: EmotionSplit,
    valid: EmotionSplit,
    settings: &TrainingSettings,
    image_size: usize,
    num_classes: usize,
    device: &B::Device,
    observers: &mut [&mut dyn EpochObserver<EmotionClassifier<B>>],
) -> Result<(EmotionClassifier<B>, TrainingHistory)> {
    let train_loader = train.into_loader::<B>(device.clone(), image_size, num_classes);
    let valid_loader = valid.into_loader::<B::InnerBackend>(device.clone(), image_size, num_classes);

    let mut optim = AdamConfig::new().init::<B, EmotionClassifier<B>>();
    let mut history = TrainingHistory::new();

    for epoch in 1..=settings.num_epochs {
        // 学習
        let mut train_metrics = RunningMetrics::default();
        for batch in train_loader.iter() {
            let output = TrainStep::step(&model, batch);
            train_metrics.update(batch_stats(&output.item));
            model = optim.step(settings.learning_rate, model, output.grads);
        }

        // 検証（ドロップアウト無効）
        let model_valid = model.valid();
        let mut valid_metrics = RunningMetrics::default();
        for batch in valid_loader.iter() {
            let output = ValidStep::step(&model_valid, batch);
            valid_metrics.update(batch_stats(&output));
        }

        let summary = EpochSummary {
            epoch,
            train_loss: train_metrics.loss(),
            train_accuracy: train_metrics.accuracy(),
            valid_loss: valid_metrics.loss(),
            valid_accuracy: valid_metrics.accuracy(),
        };
        info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            epoch,
            settings.num_epochs,
            summary.train_loss,
            summary.train_accuracy,
            summary.valid_loss,
            summary.valid_accuracy
        );
        history.push(summary);

        let mut stop = false;
        for observer in observers.iter_mut() {
            if observer.on_epoch_end(&summary, &model)? == Control::Stop {
                stop = true;
            }
        }
        if stop {
            break;
        }
    }

    for observer in observers.iter_mut() {
        model = observer.on_train_end(model);
    }

    Ok((model, history))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 学習ドライバ
///
/// 1. データセットを読み込む（`train` が無ければ何もせず `NoData`）
/// 2. クラス数を決めてモデルを構築（クラス一覧が空なら既定のクラス数）
/// 3. ベストモデル保存と早期終了を付けて学習
///
/// 学習中のエラーとパニックは `Failed` として返し、呼び出し側には伝播させません。
/// 返すモデルは推論用（自動微分なし）のバックエンドに移したものです。
pub fn train_engine<B: AutodiffBackend>(
    config: &AppConfig,
    device: &B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    let Some(datasets) = load_emotion_datasets(&config.dataset)? else {
        error!(
            "[CRITICAL] 学習データが見つかりません: {} (train フォルダを用意してください)",
            Path::new(&config.dataset.data_dir).join("train").display()
        );
        return Ok(TrainingOutcome::NoData);
    };

    let num_classes = if datasets.class_names.is_empty() {
        warn!(
            "クラスが見つかりません。クラス数 {} でモデルを構築します",
            config.model.fallback_num_classes
        );
        config.model.fallback_num_classes
    } else {
        datasets.class_names.len()
    };
    info!(
        "学習データ: {} 枚 ({} バッチ), 検証データ: {} 枚 ({} バッチ)",
        datasets.train.len(),
        datasets.train.num_batches(),
        datasets.valid.len(),
        datasets.valid.num_batches()
    );

    let image_size = config.dataset.image_size;
    let model = ModelConfig::new(num_classes)
        .with_image_size(image_size)
        .with_channels(config.model.channels)
        .with_hidden_units(config.model.hidden_units)
        .with_dropout(config.model.dropout)
        .init_with_weights::<B>(config.model.pretrained_weights.as_deref().map(Path::new), device)?;

    // メタデータに書くクラス名（クラス一覧が空なら仮の名前）
    let metadata_class_names: Vec<String> = if datasets.class_names.is_empty() {
        (0..num_classes).map(|i| format!("class_{}", i)).collect()
    } else {
        datasets.class_names.clone()
    };

    let training = &config.training;
    let checkpoint_path = PathBuf::from(&training.checkpoint_path);
    let save_path = checkpoint_path.clone();
    let model_settings = config.model.clone();

    let mut checkpoint = BestCheckpoint::new(
        training.checkpoint_monitor,
        Box::new(move |model: &EmotionClassifier<B>, summary: &EpochSummary| {
            let metadata = ModelMetadata::new(
                metadata_class_names.clone(),
                image_size,
                model_settings.channels,
                model_settings.hidden_units,
                model_settings.dropout,
                summary.epoch,
                summary.valid_accuracy,
                summary.valid_loss,
            );
            let saved = save_checkpoint(model, &metadata, &save_path)?;
            info!("チェックポイントを保存しました: {}", saved.display());
            Ok(())
        }),
    );
    let mut early_stopping = EarlyStopping::new(
        training.early_stopping_monitor,
        training.early_stopping_patience,
        training.restore_best_weights,
    );

    info!("学習を開始します（{} エポック）", training.num_epochs);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        fit(
            model,
            datasets.train.clone(),
            datasets.valid.clone(),
            training,
            image_size,
            num_classes,
            device,
            &mut [&mut checkpoint, &mut early_stopping],
        )
    }));

    let (model, history) = match result {
        Ok(Ok(trained)) => trained,
        Ok(Err(e)) => {
            error!("学習中にエラーが発生しました: {:#}", e);
            error!("ヒント: データセットの画像サイズとクラス構成、GPUドライバを確認してください");
            return Ok(TrainingOutcome::Failed(format!("{:#}", e)));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("学習中に異常終了しました: {}", message);
            error!("ヒント: メモリ不足の場合はバッチサイズか画像サイズを小さくしてください");
            return Ok(TrainingOutcome::Failed(message));
        }
    };

    if let Some(ref history_path) = training.history_path {
        match history.write_csv(Path::new(history_path)) {
            Ok(()) => info!("学習履歴を保存しました: {}", history_path),
            Err(e) => warn!("学習履歴の保存に失敗しました: {:#}", e),
        }
    }

    if checkpoint.saves() == 0 {
        warn!("検証指標が一度も得られなかったため、チェックポイントは保存されていません");
    }
    info!("[完了] 学習が終了しました");

    Ok(TrainingOutcome::Completed {
        model: model.valid(),
        class_names: datasets.class_names,
        history,
        checkpoint_saves: checkpoint.saves(),
        stopped_epoch: early_stopping.stopped_epoch(),
        checkpoint_path,
    })
}
