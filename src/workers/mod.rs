//! Worker 层：Worker trait、注册表、并行分发与内置 Worker

pub mod dispatch;
pub mod echo;
pub mod plugin;
pub mod registry;
pub mod result;

pub use dispatch::{DispatchConfig, Dispatcher, WORKER_OPERATION};
pub use echo::EchoWorker;
pub use plugin::{discover_plugins, CommandWorker};
pub use registry::{Worker, WorkerInfo, WorkerRegistry};
pub use result::WorkerResult;
