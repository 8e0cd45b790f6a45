pub mod api;
pub mod channel_objects;
pub mod clock;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod requests_queue;
pub mod scheduler;
pub mod utils;
pub mod wasm_loaders;
pub mod worker;

pub use api::api_objects::{Job, JobId, JobResult, JobStatus, Message, PoolStats, QueueStats, Role};
pub use engine::{EngineFactory, ExecutionEngine, FnEngine};
pub use error::{AdmissionError, ApiError};
pub use requests_queue::{JobRegistry, QueueConfig};
pub use scheduler::{PoolConfig, WorkerPool};
