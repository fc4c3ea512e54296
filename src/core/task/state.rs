use serde::{Deserialize, Serialize};
use std::fmt;

/// 分片下载状态
///
/// `Created → Started → Connecting → Connected → Downloading → Downloaded/Finished`，
/// 中途可能进入 `Error`、`WaitingForRetry`、`Paused`，多次协议错误后停在 `FatalError`。
/// `Merging` 只由合并器设置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PieceState {
    #[default]
    Created,
    Started,
    Connecting,
    Connected,
    Downloading,
    Error,
    FatalError,
    WaitingForRetry,
    Paused,
    Downloaded,
    Merging,
    Finished,
}

impl PieceState {
    /// 可以被暂停的状态
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            PieceState::Created
                | PieceState::Downloaded
                | PieceState::Merging
                | PieceState::Finished
                | PieceState::FatalError
        )
    }

    /// 占用一个并发名额的状态
    pub fn is_running(self) -> bool {
        matches!(
            self,
            PieceState::Started
                | PieceState::Connecting
                | PieceState::Connected
                | PieceState::Downloading
                | PieceState::Error
                | PieceState::WaitingForRetry
                | PieceState::Paused
        )
    }

    /// 下载成功结束
    pub fn is_success(self) -> bool {
        matches!(self, PieceState::Downloaded | PieceState::Finished)
    }

    /// 可以重新开始的状态
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            PieceState::Downloaded | PieceState::Finished | PieceState::FatalError
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PieceState::Finished | PieceState::FatalError)
    }

    pub fn label(self) -> &'static str {
        match self {
            PieceState::Created => "等待",
            PieceState::Started => "已启动",
            PieceState::Connecting => "连接中",
            PieceState::Connected => "已连接",
            PieceState::Downloading => "下载中",
            PieceState::Error => "错误",
            PieceState::FatalError => "失败",
            PieceState::WaitingForRetry => "等待重试",
            PieceState::Paused => "已暂停",
            PieceState::Downloaded => "已下载",
            PieceState::Merging => "合并中",
            PieceState::Finished => "完成",
        }
    }
}

impl fmt::Display for PieceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
