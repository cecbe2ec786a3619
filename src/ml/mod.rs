pub mod backbone;
pub mod callbacks;
pub mod checkpoint;
pub mod dataset;
pub mod history;
pub mod inference;
pub mod ml_model;
pub mod pretrained;
pub mod training;

pub use backbone::{MobileNetV2, MobileNetV2Config, FEATURE_CHANNELS};
pub use callbacks::{BestCheckpoint, Control, EarlyStopping, EpochObserver, EpochSummary};
pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use dataset::{load_emotion_datasets, EmotionBatch, EmotionBatcher, EmotionDatasets, EmotionItem, EmotionSplit};
pub use history::TrainingHistory;
pub use inference::{EmotionPredictor, Prediction};
pub use ml_model::{EmotionClassifier, ModelConfig, load_and_normalize_image};
pub use pretrained::WeightsFormat;
pub use training::{fit, train_engine, TrainingOutcome};
