//! Row-to-columnar conversion.

mod batch_reader;

pub use batch_reader::{BatchReader, DEFAULT_BATCH_SIZE};
