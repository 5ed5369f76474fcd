//! I/O layer: the CSV row source, the external batch API client, the run
//! directory store and the merge output writers.
pub mod rows;
pub use rows::{SourceReadError, WorkItem, read_rows};

pub mod openai;
pub use openai::{ApiError, BatchApi, OpenAiBatchClient, RequestOptions, StatusReport};

pub mod store;
pub use store::RunStore;

pub mod table;
