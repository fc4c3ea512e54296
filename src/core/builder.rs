//! 根据远程列表生成下载任务

use log::{info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::{LeechError, LeechResult};
use crate::core::task::{
    ConnectionParams, DownloadTask, FileTemplate, Merger, PieceContext, PieceWorker, RetryPolicy,
};
use crate::transport::{self, reply, RemoteEntry, SharedConnector, Transport};

/// 分组编号生成器，从 1 开始
#[derive(Debug)]
pub struct GroupIdSequence {
    next: AtomicU64,
}

impl Default for GroupIdSequence {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl GroupIdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// 生成任务所需的设置
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub piece_size: u64,
    pub buffer_size: usize,
    pub resume: bool,
    pub single_file_template: FileTemplate,
    pub multi_file_template: FileTemplate,
    pub connection: ConnectionParams,
    pub policy: RetryPolicy,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            piece_size: 15_000_000,
            buffer_size: 65_536,
            resume: false,
            single_file_template: FileTemplate::new(FileTemplate::SINGLE_DEFAULT),
            multi_file_template: FileTemplate::new(FileTemplate::MULTIPLE_DEFAULT),
            connection: ConnectionParams::default(),
            policy: RetryPolicy::default(),
        }
    }
}

pub struct TaskBuilder {
    settings: TaskSettings,
    connector: SharedConnector,
    merger: Arc<Merger>,
    group_ids: Arc<GroupIdSequence>,
}

impl TaskBuilder {
    pub fn new(settings: TaskSettings, connector: SharedConnector, merger: Arc<Merger>) -> Self {
        Self {
            settings,
            connector,
            merger,
            group_ids: Arc::new(GroupIdSequence::new()),
        }
    }

    /// 多个构建器共用同一个编号序列
    pub fn with_group_ids(mut self, group_ids: Arc<GroupIdSequence>) -> Self {
        self.group_ids = group_ids;
        self
    }

    /// 列出远程路径并生成任务
    ///
    /// 文件生成一个任务；目录在 `download_to` 下生成同名子目录，递归地为每个文件生成任务。
    pub fn create_tasks(&self, remote_path: &str, download_to: &Path) -> LeechResult<Vec<DownloadTask>> {
        let mut session = transport::open_transport(self.connector.as_ref(), &self.settings.connection)?;
        let mut tasks = Vec::new();
        let result = self.collect(session.as_mut(), remote_path, download_to, &mut tasks);
        let _ = session.disconnect();
        result.map(|_| tasks)
    }

    fn collect(
        &self,
        transport: &mut dyn Transport,
        remote_path: &str,
        download_to: &Path,
        tasks: &mut Vec<DownloadTask>,
    ) -> LeechResult<()> {
        let entries = transport.list_entries(remote_path)?;
        if reply::is_failure(transport.reply_code()) {
            return Err(LeechError::protocol(transport.reply_code(), transport.reply_string()));
        }

        let base = remote_path.trim_end_matches('/');
        let name = base.rsplit('/').next().unwrap_or_default();
        if let [entry] = entries.as_slice() {
            if !entry.is_directory && entry.name == name {
                tasks.push(self.file_task(remote_path, entry, download_to)?);
                return Ok(());
            }
        }

        let target = if name.is_empty() {
            download_to.to_path_buf()
        } else {
            download_to.join(name)
        };
        if entries.is_empty() {
            warn!("远程目录为空: {}", remote_path);
        }
        for entry in &entries {
            let child = format!("{}/{}", base, entry.name);
            if entry.is_directory {
                self.collect(transport, &child, &target, tasks)?;
            } else {
                tasks.push(self.file_task(&child, entry, &target)?);
            }
        }
        Ok(())
    }

    fn file_task(&self, remote_path: &str, entry: &RemoteEntry, output_dir: &Path) -> LeechResult<DownloadTask> {
        let settings = &self.settings;
        let group_id = self.group_ids.next_id();
        let piece_size = settings.piece_size.max(1);
        let parts = entry.size.div_ceil(piece_size).max(1) as usize;

        let pieces = (0..parts)
            .map(|part| {
                let start = part as u64 * piece_size;
                let piece_length = if part + 1 == parts {
                    entry.size - start
                } else {
                    piece_size
                };
                let context = PieceContext {
                    remote_path: remote_path.to_string(),
                    file_name: entry.name.clone(),
                    group_id,
                    part,
                    parts,
                    global_piece_length: piece_size,
                    piece_length,
                    output_dir: output_dir.to_path_buf(),
                    single_file_template: settings.single_file_template.clone(),
                    multi_file_template: settings.multi_file_template.clone(),
                    buffer_size: settings.buffer_size,
                    resume: settings.resume,
                    connection: settings.connection.clone(),
                };
                PieceWorker::new(context, self.connector.clone(), settings.policy.clone())
            })
            .collect();

        info!(
            "{} ({} 字节) 分为 {} 个分片，保存到 {}",
            remote_path,
            entry.size,
            parts,
            output_dir.display()
        );
        DownloadTask::new(remote_path, pieces, &self.merger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::Scheduler;
    use crate::core::task::test_support::{fast_policy, wait_until};
    use crate::core::task::{MergeOptions, PieceState};
    use crate::transport::simulated::{SimulatedConnector, SimulatedServer};
    use std::fs;
    use std::time::Duration;

    fn builder(server: &SimulatedServer, piece_size: u64) -> TaskBuilder {
        let settings = TaskSettings {
            piece_size,
            policy: fast_policy(),
            ..TaskSettings::default()
        };
        let merger = Arc::new(Merger::new(MergeOptions {
            unwind_delay: Duration::from_millis(5),
            ..MergeOptions::default()
        }));
        TaskBuilder::new(settings, Arc::new(SimulatedConnector::new(server.clone())), merger)
    }

    #[test]
    fn test_split_into_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.add_random_file("/pub/big.bin", 250_000);

        let tasks = builder(&server, 100_000).create_tasks("/pub/big.bin", dir.path()).unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        let lengths: Vec<u64> = task.pieces.iter().map(|p| p.length()).collect();
        assert_eq!(lengths, vec![100_000, 100_000, 50_000]);
        assert!(task.group.is_some());
        let ctx = task.pieces[2].context();
        assert_eq!(ctx.parts, 3);
        assert_eq!(ctx.remote_offset(0), 200_000);
        assert_eq!(ctx.output_dir, dir.path());
        assert_eq!(server.stats().open_connections, 0);
    }

    #[test]
    fn test_small_and_empty_files_are_single_piece() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.add_file("/pub/small.txt", b"hello".to_vec());
        server.add_file("/pub/empty.txt", Vec::new());
        let b = builder(&server, 100);

        let small = b.create_tasks("/pub/small.txt", dir.path()).unwrap();
        assert_eq!(small[0].pieces.len(), 1);
        assert!(small[0].group.is_none());
        let empty = b.create_tasks("/pub/empty.txt", dir.path()).unwrap();
        assert_eq!(empty[0].pieces.len(), 1);
        assert_eq!(empty[0].pieces[0].length(), 0);
        assert_ne!(small[0].pieces[0].piece_context().group_id, empty[0].pieces[0].piece_context().group_id);
    }

    #[test]
    fn test_directory_is_traversed() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.add_file("/pub/tree/a.bin", vec![1; 10]);
        server.add_file("/pub/tree/sub/b.bin", vec![2; 20]);

        let tasks = builder(&server, 100).create_tasks("/pub/tree", dir.path()).unwrap();
        let mut found: Vec<(String, std::path::PathBuf)> = tasks
            .iter()
            .map(|t| (t.remote_path.clone(), t.pieces[0].piece_context().output_dir.clone()))
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("/pub/tree/a.bin".to_string(), dir.path().join("tree")),
                ("/pub/tree/sub/b.bin".to_string(), dir.path().join("tree").join("sub")),
            ]
        );
    }

    #[test]
    fn test_missing_remote_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        let err = builder(&server, 100).create_tasks("/nothing", dir.path()).err().unwrap();
        assert!(err.is_fatal());
        assert_eq!(err.reply_code(), Some(reply::FILE_UNAVAILABLE));
    }

    #[test]
    fn test_group_ids_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.add_file("/a", vec![0; 4]);
        let ids = Arc::new(GroupIdSequence::new());
        let first = builder(&server, 10).with_group_ids(ids.clone());
        let second = builder(&server, 10).with_group_ids(ids.clone());

        let a = first.create_tasks("/a", dir.path()).unwrap();
        let b = second.create_tasks("/a", dir.path()).unwrap();
        assert_eq!(a[0].pieces[0].piece_context().group_id, 1);
        assert_eq!(b[0].pieces[0].piece_context().group_id, 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_end_to_end_download_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        let big = server.add_random_file("/pub/big.bin", 250_000);
        let small = server.add_random_file("/pub/small.bin", 1_000);
        server.fail_stream_after(40_000);
        let b = builder(&server, 100_000);

        let mut tasks = b.create_tasks("/pub/big.bin", dir.path()).unwrap();
        tasks.extend(b.create_tasks("/pub/small.bin", dir.path()).unwrap());
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.enqueue(&tasks);

        assert!(wait_until(Duration::from_secs(20), || tasks.iter().all(|t| t.is_settled())));
        assert!(tasks.iter().all(|t| t.is_finished()));
        assert_eq!(tasks[0].group.as_ref().unwrap().merged(), Some(true));
        assert_eq!(fs::read(dir.path().join("big.bin")).unwrap(), *big);
        assert_eq!(fs::read(dir.path().join("small.bin")).unwrap(), *small);
        assert!(!dir.path().join("big.bin.part000").exists());
        assert!(scheduler.pieces().iter().all(|p| p.state() == PieceState::Finished));
        assert!(server.stats().peak_connections <= 2);
    }
}
