//! 学習履歴
//!
//! エポックごとの損失・精度を保持し、CSVに書き出します。

use anyhow::{Context, Result};
use std::path::Path;

use crate::ml::callbacks::EpochSummary;

/// エポックごとの指標の記録
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    epochs: Vec<EpochSummary>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, summary: EpochSummary) {
        self.epochs.push(summary);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }

    /// 検証精度が最も高かったエポック（NaNは除外）
    pub fn best_by_accuracy(&self) -> Option<&EpochSummary> {
        self.epochs
            .iter()
            .filter(|s| !s.valid_accuracy.is_nan())
            .max_by(|a, b| a.valid_accuracy.total_cmp(&b.valid_accuracy))
    }

    /// CSVに書き出す
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
            }
        }

        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create history file: {:?}", path))?;
        for summary in &self.epochs {
            writer.serialize(summary)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(epoch: usize, valid_accuracy: f64) -> EpochSummary {
        EpochSummary {
            epoch,
            train_loss: 1.0 / epoch as f64,
            train_accuracy: 0.5,
            valid_loss: 0.8,
            valid_accuracy,
        }
    }

    #[test]
    fn test_best_by_accuracy_skips_nan() {
        let mut history = TrainingHistory::new();
        history.push(summary(1, f64::NAN));
        history.push(summary(2, 0.6));
        history.push(summary(3, 0.4));
        assert_eq!(history.best_by_accuracy().map(|s| s.epoch), Some(2));
        assert_eq!(history.last().map(|s| s.epoch), Some(3));
    }

    #[test]
    fn test_write_csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("history.csv");

        let mut history = TrainingHistory::new();
        history.push(summary(1, 0.25));
        history.push(summary(2, 0.5));
        history.write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "epoch,train_loss,train_accuracy,valid_loss,valid_accuracy");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2,0.5,0.5,0.8,0.5"));
    }
}
