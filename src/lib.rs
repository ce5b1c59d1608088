mod atomic_file;
mod delta;
mod wire;

pub mod block_view;
pub mod buckets;
pub mod checksum;
pub mod codec;
pub mod columns;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod features;
pub mod index;
pub mod metrics;
pub mod moments;
pub mod pipeline;
pub mod report;
pub mod returns;
pub mod scheduler;
pub mod signals;
pub mod snapshot;
pub mod validate;

pub use codec::{EncodeOptions, EncodedBlob, decode_day, encode, encode_with};
pub use columns::{ColumnPool, DayColumns, TradeRow};
pub use config::StudyConfig;
pub use error::{CodecError, EncodeError, PipelineError, StoreError};
pub use index::{DayTask, IndexEntry, IndexStore, Period};
pub use metrics::{MetricStats, finalize};
pub use moments::Moments;
pub use pipeline::{SignalSource, StudyResult, analyze, compute_signals};
pub use scheduler::{CancelToken, DayOutcome, RunSummary};
pub use signals::{Signal, SignalSpec, TradeEvent};
