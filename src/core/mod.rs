//! Core: 分片下载、分组合并、任务调度、错误处理等核心逻辑模块

pub mod builder;
pub mod error;
pub mod scheduler;
pub mod task;

// 只导出主流程和其它模块实际用到的类型
pub use builder::{GroupIdSequence, TaskBuilder, TaskSettings};
pub use error::{LeechError, LeechResult};
pub use scheduler::{PieceSnapshot, Scheduler, Statistics};
pub use task::{DownloadTask, PieceState, PieceWorker};
