use super::state::PieceState;
use super::worker::PieceWorker;
use crate::core::error::LeechError;

/// 分片事件的观察者
///
/// 回调在下载线程上同步执行，慢的观察者会拖慢下载线程。
/// 回调里不要再对同一个分片注册或注销观察者。
pub trait DownloadListener: Send + Sync {
    /// 可恢复错误，下载线程会等待后重试
    fn on_error(&self, _source: &PieceWorker, _error: &LeechError) {}

    /// 本次尝试无法恢复的错误，是否继续重试由重试策略决定
    fn on_fatal_error(&self, _source: &PieceWorker, _error: &LeechError) {}

    /// `rate` 为最近一个统计周期的字节/秒
    fn on_progress(&self, _source: &PieceWorker, _downloaded: u64, _rate: u64) {}

    fn on_state_change(&self, _source: &PieceWorker, _state: PieceState) {}
}

/// 界面层的聚合通知
pub trait NotificationAdapter: Send + Sync {
    /// 队列结构变化（新任务入队等）
    fn on_bulk_change(&self);

    fn on_item_change(&self, piece: &PieceWorker);
}
