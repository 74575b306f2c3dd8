//! # Data Loading Module
//!
//! Sequence datasets and the padded batch loader that feeds train and eval
//! graphs.
//!
//! ## Key Components
//!
//! - [`SequenceSource`]: Trait for variable-length labelled sequences
//! - [`InMemorySequenceDataset`]: Sequences held in memory
//! - [`PaddedBatchLoader`]: Full batches, zero-padded or truncated to `num_steps`
//!
//! ## Example
//!
//! ```ignore
//! use structured_melody_rnn::data::{InMemorySequenceDataset, PaddedBatchLoader};
//!
//! let dataset = InMemorySequenceDataset::new(examples)?;
//! let loader = PaddedBatchLoader::new(dataset, 64, 128)
//!     .shuffle(true)
//!     .seed(7);
//!
//! for batch in loader.iter() {
//!     // batch.inputs [B, T, F], batch.labels [B, T], batch.lengths [B]
//! }
//! ```

pub mod dataloader;
pub mod dataset;

pub use dataloader::{PaddedBatch, PaddedBatchLoader};
pub use dataset::{DataError, InMemorySequenceDataset, SequenceExample, SequenceSource};
