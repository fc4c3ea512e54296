//! 全局调度：限制同时运行的分片数，任何分片状态变化都会重新评估

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::error::{LeechError, LeechResult};
use crate::core::task::{DownloadListener, DownloadTask, NotificationAdapter, PieceState, PieceWorker};

/// 全局统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// 所有分片速度之和，字节/秒
    pub speed: u64,
    pub total: u64,
    pub downloaded: u64,
    pub remaining: u64,
    /// 速度为 0 时为 0
    pub eta: Duration,
    pub active: usize,
    pub queued: usize,
    pub finished: usize,
    pub failed: usize,
}

/// 单个分片的可序列化快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSnapshot {
    pub index: usize,
    pub remote_path: String,
    pub file_name: String,
    pub group_id: u64,
    pub part: usize,
    pub parts: usize,
    pub length: u64,
    pub downloaded: u64,
    pub speed: u64,
    pub state: PieceState,
    pub local_file: PathBuf,
    pub last_error: Option<String>,
}

impl PieceSnapshot {
    fn capture(piece: &PieceWorker) -> Self {
        let info = piece.piece_context();
        Self {
            index: piece.index(),
            remote_path: info.remote_path.clone(),
            file_name: info.file_name.clone(),
            group_id: info.group_id,
            part: info.part,
            parts: info.parts,
            length: info.piece_length,
            downloaded: piece.downloaded(),
            speed: piece.speed(),
            state: piece.state(),
            local_file: info.local_file(),
            last_error: piece.last_error().map(|e| e.to_string()),
        }
    }
}

#[derive(Default)]
struct Queue {
    /// 只追加，不删除
    pieces: Vec<PieceWorker>,
    limit: usize,
    next_index: usize,
    /// 每次状态变化加一，调度线程据此判断是否需要重新扫描
    events: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    adapter: Mutex<Option<Arc<dyn NotificationAdapter>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Queue>) -> MutexGuard<'a, Queue> {
        self.wakeup.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        self.lock().events += 1;
        self.wakeup.notify_all();
    }

    fn adapter(&self) -> Option<Arc<dyn NotificationAdapter>> {
        self.adapter.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn item_changed(&self, piece: &PieceWorker) {
        if let Some(adapter) = self.adapter() {
            adapter.on_item_change(piece);
        }
    }
}

/// 注册到每个分片上，只持有弱引用
struct QueueListener {
    shared: Weak<Shared>,
}

impl DownloadListener for QueueListener {
    fn on_error(&self, source: &PieceWorker, _error: &LeechError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.item_changed(source);
        }
    }

    fn on_fatal_error(&self, source: &PieceWorker, _error: &LeechError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.item_changed(source);
        }
    }

    fn on_progress(&self, source: &PieceWorker, _downloaded: u64, _rate: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.item_changed(source);
        }
    }

    fn on_state_change(&self, source: &PieceWorker, _state: PieceState) {
        if let Some(shared) = self.shared.upgrade() {
            shared.touch();
            shared.item_changed(source);
        }
    }
}

/// 全局调度器
///
/// 所有入队的分片按顺序保存，调度线程在名额允许时启动 Created 状态的分片。
/// 调度器关闭后不再启动新分片，已运行的分片不受影响。
pub struct Scheduler {
    shared: Arc<Shared>,
    listener: Arc<dyn DownloadListener>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(working_threads: usize) -> LeechResult<Self> {
        let shared = Arc::new(Shared::default());
        shared.lock().limit = working_threads;
        let listener: Arc<dyn DownloadListener> = Arc::new(QueueListener {
            shared: Arc::downgrade(&shared),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || schedule_loop(&worker_shared))?;
        info!("调度器已启动，并发数 {}", working_threads);
        Ok(Self {
            shared,
            listener,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// 追加任务的所有分片，按顺序分配界面索引
    pub fn enqueue(&self, tasks: &[DownloadTask]) {
        let pieces: Vec<PieceWorker> = tasks.iter().flat_map(|t| t.pieces.iter().cloned()).collect();
        if pieces.is_empty() {
            return;
        }
        for piece in &pieces {
            piece.register_listener(self.listener.clone());
        }
        {
            let mut queue = self.shared.lock();
            for piece in pieces {
                piece.set_index(queue.next_index);
                queue.next_index += 1;
                queue.pieces.push(piece);
            }
            queue.events += 1;
        }
        self.shared.wakeup.notify_all();
        if let Some(adapter) = self.shared.adapter() {
            adapter.on_bulk_change();
        }
    }

    /// 运行时修改并发数，立即生效
    pub fn set_working_threads(&self, working_threads: usize) {
        {
            let mut queue = self.shared.lock();
            queue.limit = working_threads;
            queue.events += 1;
        }
        info!("并发数调整为 {}", working_threads);
        self.shared.wakeup.notify_all();
    }

    pub fn working_threads(&self) -> usize {
        self.shared.lock().limit
    }

    pub fn set_notification_adapter(&self, adapter: Option<Arc<dyn NotificationAdapter>>) {
        *self.shared.adapter.lock().unwrap_or_else(|e| e.into_inner()) = adapter;
    }

    pub fn size(&self) -> usize {
        self.shared.lock().pieces.len()
    }

    pub fn get(&self, index: usize) -> Option<PieceWorker> {
        self.shared.lock().pieces.get(index).cloned()
    }

    pub fn pieces(&self) -> Vec<PieceWorker> {
        self.shared.lock().pieces.clone()
    }

    pub fn statistics(&self) -> Statistics {
        let queue = self.shared.lock();
        let mut stats = Statistics::default();
        for piece in &queue.pieces {
            let downloaded = piece.downloaded();
            let state = piece.state();
            stats.speed += piece.speed();
            stats.total += piece.length();
            stats.downloaded += downloaded;
            stats.remaining += piece.length().saturating_sub(downloaded);
            if piece.occupies_slot() {
                stats.active += 1;
            }
            match state {
                PieceState::Created => stats.queued += 1,
                PieceState::Finished => stats.finished += 1,
                PieceState::FatalError => stats.failed += 1,
                _ => {}
            }
        }
        if stats.speed > 0 {
            stats.eta = Duration::from_secs(stats.remaining / stats.speed);
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<PieceSnapshot> {
        self.pieces().iter().map(PieceSnapshot::capture).collect()
    }

    /// 暂停所有可暂停的分片，返回暂停的数量
    pub fn pause_all(&self) -> usize {
        self.pieces()
            .iter()
            .filter(|p| p.state().is_active() && p.state() != PieceState::Paused)
            .filter(|p| p.set_pause(true).is_ok())
            .count()
    }

    pub fn resume_all(&self) {
        for piece in self.pieces() {
            if let Err(e) = piece.set_pause(false) {
                debug!("[{}] 恢复失败: {}", piece.name(), e);
            }
        }
    }

    /// 停止调度线程
    pub fn shutdown(&self) -> LeechResult<()> {
        {
            let mut queue = self.shared.lock();
            if queue.shutdown {
                return Ok(());
            }
            queue.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| LeechError::invalid_state("调度线程异常退出"))?;
        }
        info!("调度器已停止");
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn active_count(queue: &Queue) -> usize {
    queue.pieces.iter().filter(|p| p.occupies_slot()).count()
}

fn schedule_loop(shared: &Shared) {
    let mut queue = shared.lock();
    while !queue.shutdown {
        let mut active = active_count(&queue);
        let mut index = 0;
        while index < queue.pieces.len() && active < queue.limit && !queue.shutdown {
            let piece = queue.pieces[index].clone();
            index += 1;
            if piece.state() != PieceState::Created || piece.is_attached() {
                continue;
            }
            let before = queue.events;
            if !piece.start() {
                continue;
            }
            debug!("启动分片 {}", piece.name());
            // 等新分片的 Started 通知到达后再重新统计，已经结束的分片不占名额
            while queue.events == before && !queue.shutdown {
                queue = shared.wait(queue);
            }
            active = active_count(&queue);
        }

        let seen = queue.events;
        while queue.events == seen && !queue.shutdown {
            queue = shared.wait(queue);
        }
    }
    debug!("调度线程退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::context::test_context;
    use crate::core::task::test_support::{fast_policy, wait_until};
    use crate::core::task::{MergeOptions, Merger};
    use crate::transport::simulated::{SimulatedConnector, SimulatedServer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(20);

    fn single_file_tasks(server: &SimulatedServer, dir: &std::path::Path, count: usize, size: u64) -> Vec<DownloadTask> {
        let connector = Arc::new(SimulatedConnector::new(server.clone()));
        let merger = Arc::new(Merger::new(MergeOptions::default()));
        (0..count)
            .map(|i| {
                let name = format!("f{}.bin", i);
                server.add_random_file(&format!("/pub/{}", name), size);
                let mut ctx = test_context(dir, &name, 0, 1, size);
                ctx.group_id = i as u64 + 1;
                let worker = PieceWorker::new(ctx, connector.clone(), fast_policy());
                DownloadTask::new(format!("/pub/{}", name), vec![worker], &merger).unwrap()
            })
            .collect()
    }

    fn all_finished(scheduler: &Scheduler) -> bool {
        scheduler.pieces().iter().all(|p| p.state() == PieceState::Finished && !p.is_attached())
    }

    #[test]
    fn test_concurrency_bound() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.set_read_throttle(10_000, Duration::from_millis(2));
        let tasks = single_file_tasks(&server, dir.path(), 6, 100_000);

        let scheduler = Scheduler::new(2).unwrap();
        scheduler.enqueue(&tasks);
        assert_eq!(scheduler.size(), 6);
        assert!(wait_until(WAIT, || all_finished(&scheduler)));

        let stats = server.stats();
        assert_eq!(stats.connections, 6);
        assert!(stats.peak_connections <= 2, "peak {}", stats.peak_connections);
        let summary = scheduler.statistics();
        assert_eq!(summary.finished, 6);
        assert_eq!(summary.remaining, 0);
        assert_eq!(summary.active, 0);
    }

    #[test]
    fn test_raising_limit_wakes_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.set_read_throttle(10_000, Duration::from_millis(1));
        let tasks = single_file_tasks(&server, dir.path(), 5, 50_000);

        let scheduler = Scheduler::new(0).unwrap();
        scheduler.enqueue(&tasks);
        thread::sleep(Duration::from_millis(50));
        assert!(scheduler.pieces().iter().all(|p| p.state() == PieceState::Created));

        let stats = scheduler.statistics();
        assert_eq!(stats.queued, 5);
        assert_eq!(stats.remaining, 250_000);
        assert_eq!(stats.speed, 0);
        assert_eq!(stats.eta, Duration::ZERO);

        scheduler.set_working_threads(3);
        assert_eq!(scheduler.working_threads(), 3);
        assert!(wait_until(WAIT, || all_finished(&scheduler)));
        assert!(server.stats().peak_connections <= 3);
    }

    #[test]
    fn test_lowering_limit_at_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        server.set_read_throttle(5_000, Duration::from_millis(2));
        let tasks = single_file_tasks(&server, dir.path(), 6, 50_000);

        let scheduler = Scheduler::new(3).unwrap();
        scheduler.enqueue(&tasks);
        assert!(wait_until(WAIT, || scheduler.statistics().active > 0));
        scheduler.set_working_threads(1);
        // 已运行的分片结束后，同时运行的分片不超过新的并发数
        assert!(wait_until(WAIT, || scheduler.statistics().active <= 1));
        for _ in 0..20 {
            assert!(scheduler.statistics().active <= 1);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(wait_until(WAIT, || all_finished(&scheduler)));
    }

    #[test]
    fn test_indices_and_adapter() {
        #[derive(Default)]
        struct CountingAdapter {
            bulk: AtomicUsize,
            items: AtomicUsize,
        }
        impl NotificationAdapter for CountingAdapter {
            fn on_bulk_change(&self) {
                self.bulk.fetch_add(1, Ordering::SeqCst);
            }
            fn on_item_change(&self, _piece: &PieceWorker) {
                self.items.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        let first = single_file_tasks(&server, dir.path(), 2, 1000);
        let adapter = Arc::new(CountingAdapter::default());
        let scheduler = Scheduler::new(0).unwrap();
        scheduler.set_notification_adapter(Some(adapter.clone()));

        scheduler.enqueue(&first);
        scheduler.enqueue(&first[..0]);
        let second = single_file_tasks(&server, dir.path(), 1, 1000);
        scheduler.enqueue(&second);

        let indices: Vec<usize> = scheduler.pieces().iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(scheduler.get(2).unwrap(), second[0].pieces[0]);
        assert_eq!(adapter.bulk.load(Ordering::SeqCst), 2);

        scheduler.set_working_threads(4);
        assert!(wait_until(WAIT, || all_finished(&scheduler)));
        assert!(adapter.items.load(Ordering::SeqCst) >= 3 * 5);
    }

    #[test]
    fn test_failed_piece_frees_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        let mut tasks = single_file_tasks(&server, dir.path(), 3, 1000);
        // 远程不存在的文件：每次打开都返回 550
        let connector = Arc::new(SimulatedConnector::new(server.clone()));
        let missing = PieceWorker::new(test_context(dir.path(), "missing.bin", 0, 1, 10), connector, fast_policy());
        let merger = Arc::new(Merger::default());
        tasks.insert(0, DownloadTask::new("/pub/missing.bin", vec![missing.clone()], &merger).unwrap());

        let scheduler = Scheduler::new(1).unwrap();
        scheduler.enqueue(&tasks);
        assert!(wait_until(WAIT, || {
            scheduler.statistics().finished == 3 && !missing.is_attached()
        }));
        assert_eq!(missing.state(), PieceState::FatalError);
        assert_eq!(scheduler.statistics().failed, 1);
        assert!(server.stats().peak_connections <= 1);
    }

    #[test]
    fn test_snapshot_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = SimulatedServer::new();
        let tasks = single_file_tasks(&server, dir.path(), 2, 2000);
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.enqueue(&tasks);
        assert!(wait_until(WAIT, || all_finished(&scheduler)));

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].index, 1);
        assert_eq!(snapshot[0].downloaded, 2000);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"Finished\""));
        let restored: Vec<PieceSnapshot> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);

        scheduler.shutdown().unwrap();
        scheduler.shutdown().unwrap();
    }
}
