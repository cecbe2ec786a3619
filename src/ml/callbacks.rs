//! エポック終了時のコールバック
//!
//! - [`BestCheckpoint`]: 監視指標が改善した時だけモデルを保存
//! - [`EarlyStopping`]: 監視指標が一定エポック改善しなければ学習を止める
//!
//! どちらも「これまでの最良値」と「改善なしのエポック数」だけを持つ状態機械です。

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::model::MonitoredMetric;

/// 1エポック分の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochSummary {
    /// エポック番号（1始まり）
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

impl EpochSummary {
    /// 監視対象の値を取り出す
    pub fn metric(&self, metric: MonitoredMetric) -> f64 {
        match metric {
            MonitoredMetric::ValidLoss => self.valid_loss,
            MonitoredMetric::ValidAccuracy => self.valid_accuracy,
        }
    }
}

/// 学習ループへの指示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// エポック終了時に呼ばれる観測者
pub trait EpochObserver<M> {
    /// エポック終了時
    fn on_epoch_end(&mut self, summary: &EpochSummary, model: &M) -> Result<Control>;

    /// 学習終了時（最終モデルの差し替えが可能）
    fn on_train_end(&mut self, model: M) -> M {
        model
    }
}

/// 保存処理
pub type SaveFn<M> = Box<dyn FnMut(&M, &EpochSummary) -> Result<()>>;

/// 監視指標が改善した時のみモデルを保存する
pub struct BestCheckpoint<M> {
    monitor: MonitoredMetric,
    best: f64,
    saves: usize,
    save: SaveFn<M>,
}

impl<M> BestCheckpoint<M> {
    pub fn new(monitor: MonitoredMetric, save: SaveFn<M>) -> Self {
        Self {
            monitor,
            best: monitor.initial_best(),
            saves: 0,
            save,
        }
    }

    /// これまでの最良値
    pub fn best(&self) -> f64 {
        self.best
    }

    /// 保存した回数
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl<M> EpochObserver<M> for BestCheckpoint<M> {
    fn on_epoch_end(&mut self, summary: &EpochSummary, model: &M) -> Result<Control> {
        let value = summary.metric(self.monitor);
        if self.monitor.is_improvement(value, self.best) {
            info!(
                "Epoch {}: {} が {:.5} から {:.5} に改善、モデルを保存します",
                summary.epoch, self.monitor, self.best, value
            );
            (self.save)(model, summary)?;
            self.best = value;
            self.saves += 1;
        } else {
            info!(
                "Epoch {}: {} は {:.5} から改善しませんでした",
                summary.epoch, self.monitor, self.best
            );
        }
        Ok(Control::Continue)
    }
}

/// 監視指標が `patience` エポック連続で改善しなければ学習を止める
pub struct EarlyStopping<M> {
    monitor: MonitoredMetric,
    patience: usize,
    restore_best_weights: bool,
    best: f64,
    wait: usize,
    best_model: Option<M>,
    stopped_epoch: Option<usize>,
}

impl<M: Clone> EarlyStopping<M> {
    pub fn new(monitor: MonitoredMetric, patience: usize, restore_best_weights: bool) -> Self {
        Self {
            monitor,
            patience,
            restore_best_weights,
            best: monitor.initial_best(),
            wait: 0,
            best_model: None,
            stopped_epoch: None,
        }
    }

    /// 改善なしで経過したエポック数
    pub fn wait(&self) -> usize {
        self.wait
    }

    /// 停止したエポック（停止していなければNone）
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

impl<M: Clone> EpochObserver<M> for EarlyStopping<M> {
    fn on_epoch_end(&mut self, summary: &EpochSummary, model: &M) -> Result<Control> {
        let value = summary.metric(self.monitor);
        if self.monitor.is_improvement(value, self.best) {
            self.best = value;
            self.wait = 0;
            if self.restore_best_weights {
                self.best_model = Some(model.clone());
            }
            return Ok(Control::Continue);
        }

        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(summary.epoch);
            info!(
                "Epoch {}: {} が {} エポック改善しなかったため早期終了します",
                summary.epoch, self.monitor, self.wait
            );
            return Ok(Control::Stop);
        }
        Ok(Control::Continue)
    }

    fn on_train_end(&mut self, model: M) -> M {
        // 早期終了した場合のみベストの重みに戻す
        if self.stopped_epoch.is_none() {
            return model;
        }
        match self.best_model.take() {
            Some(best) => {
                info!("最良エポックの重みに戻します");
                best
            }
            None => model,
        }
    }
}
