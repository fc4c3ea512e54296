//! `task` 模块包含单个远程文件下载相关的所有逻辑
//!
//! 主要包括：
//! - `state`: 分片状态 `PieceState`
//! - `context`: 分片配置 `PieceContext` 与文件名模板
//! - `listener`: 事件回调接口
//! - `retry`: 重试策略
//! - `worker`: 分片下载线程 `PieceWorker`
//! - `group`: 分片分组 `PieceGroup`
//! - `merger`: 分片合并

pub mod context;
pub mod group;
pub mod listener;
pub mod merger;
pub mod retry;
pub mod state;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

pub use context::{ConnectionMode, ConnectionParams, FileTemplate, PieceContext, TransferType};
pub use group::PieceGroup;
pub use listener::{DownloadListener, NotificationAdapter};
pub use merger::{MergeOptions, Merger};
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use state::PieceState;
pub use worker::PieceWorker;

use crate::core::error::LeechResult;

/// 一个远程文件的下载任务
pub struct DownloadTask {
    pub remote_path: String,
    pub pieces: Vec<PieceWorker>,
    /// 多于一个分片时才有分组
    pub group: Option<Arc<PieceGroup>>,
}

impl DownloadTask {
    pub fn new(remote_path: impl Into<String>, pieces: Vec<PieceWorker>, merger: &Arc<Merger>) -> LeechResult<Self> {
        let group = if pieces.len() > 1 {
            Some(PieceGroup::new(pieces.clone(), merger.clone())?)
        } else {
            None
        };
        Ok(Self {
            remote_path: remote_path.into(),
            pieces,
            group,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.pieces.iter().map(|p| p.length()).sum()
    }

    pub fn downloaded(&self) -> u64 {
        self.pieces.iter().map(|p| p.downloaded()).sum()
    }

    /// 所有分片都已完成（多分片文件需要已合并）
    pub fn is_finished(&self) -> bool {
        self.pieces.iter().all(|p| p.state() == PieceState::Finished)
    }

    /// 不会再有进展：所有下载线程已退出，合并已结束或不会发生
    pub fn is_settled(&self) -> bool {
        let idle = self.pieces.iter().all(|p| {
            !p.is_attached()
                && matches!(
                    p.state(),
                    PieceState::Finished | PieceState::FatalError | PieceState::Downloaded | PieceState::Error
                )
        });
        if !idle {
            return false;
        }
        match &self.group {
            Some(group) => {
                group.merged().is_some() || self.pieces.iter().any(|p| p.state() == PieceState::FatalError)
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::context::test_context;
    use crate::core::task::test_support::fast_policy;
    use crate::transport::simulated::{SimulatedConnector, SimulatedServer};
    use std::time::Duration;

    #[test]
    fn test_task_group_only_for_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(SimulatedConnector::new(SimulatedServer::new()));
        let merger = Arc::new(Merger::default());

        let single = PieceWorker::new(test_context(dir.path(), "a", 0, 1, 10), connector.clone(), fast_policy());
        let task = DownloadTask::new("/pub/a", vec![single], &merger).unwrap();
        assert!(task.group.is_none());
        assert!(!task.is_settled());

        let parts = (0..3)
            .map(|i| PieceWorker::new(test_context(dir.path(), "b", i, 3, 10), connector.clone(), fast_policy()))
            .collect();
        let task = DownloadTask::new("/pub/b", parts, &merger).unwrap();
        assert!(task.group.is_some());
        assert_eq!(task.total_length(), 30);
        assert_eq!(task.downloaded(), 0);
        assert!(!task.is_finished());
    }

    #[test]
    fn test_task_settles_after_download() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.add_random_file("/pub/a", 100);
        let connector = Arc::new(SimulatedConnector::new(server));
        let merger = Arc::new(Merger::default());
        let worker = PieceWorker::new(test_context(dir.path(), "a", 0, 1, 100), connector, fast_policy());
        let task = DownloadTask::new("/pub/a", vec![worker.clone()], &merger).unwrap();

        assert!(worker.start());
        assert!(worker.wait_detached(Duration::from_secs(5)));
        assert!(task.is_finished());
        assert!(task.is_settled());
        assert_eq!(task.downloaded(), 100);
    }
}
