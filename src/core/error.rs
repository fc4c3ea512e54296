use std::borrow::Cow;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::transport::reply::reply_code_name;

/// 错误分类，决定下载线程的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 网络抖动等可恢复错误，无限次重试
    Transient,
    /// 协议层错误，有限次重试后进入 FatalError
    Fatal,
    /// 调用方误用（非法状态转换等），立即拒绝
    Consistency,
    /// 未分类错误，线程停在 Error 状态等待外部唤醒
    Unclassified,
}

#[derive(Error, Debug)]
pub enum LeechError {
    #[error("协议错误: {code_name} ({code})\n{message}")]
    Protocol {
        code: u32,
        code_name: &'static str,
        message: String,
    },

    #[error("无法创建目录: {}", .0.display())]
    CreateFolder(PathBuf),

    #[error("无法删除文件: {}", .0.display())]
    DeleteFile(PathBuf),

    #[error("已下载部分大于分片长度: 文件 {}, 实际 {actual} 字节, 分片 {expected} 字节", .path.display())]
    ResumeOffset {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },

    #[error("无法设置传输类型: {0}")]
    TransferType(String),

    #[error("远程路径不存在: {0}")]
    RemoteNotFound(String),

    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    #[error("非法状态: {0}")]
    InvalidState(Cow<'static, str>),

    #[error("合并长度不匹配: 文件 {}, 预期 {expected} 字节, 实际 {actual} 字节", .path.display())]
    MergeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("合并错误: {0}")]
    Merge(String),

    #[error("不支持的协议: {0}")]
    UnsupportedProtocol(String),

    #[error("配置错误: {0}")]
    Config(Cow<'static, str>),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl LeechError {
    /// 根据服务器返回码构造协议错误
    pub fn protocol(code: u32, message: impl Into<String>) -> Self {
        LeechError::Protocol {
            code,
            code_name: reply_code_name(code),
            message: message.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<Cow<'static, str>>) -> Self {
        LeechError::InvalidState(msg.into())
    }

    pub fn config(msg: impl Into<Cow<'static, str>>) -> Self {
        LeechError::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LeechError::Io(_) => ErrorKind::Transient,
            LeechError::Protocol { .. }
            | LeechError::CreateFolder(_)
            | LeechError::DeleteFile(_)
            | LeechError::ResumeOffset { .. }
            | LeechError::TransferType(_)
            | LeechError::RemoteNotFound(_) => ErrorKind::Fatal,
            LeechError::InvalidState(_) => ErrorKind::Consistency,
            LeechError::MergeMismatch { .. }
            | LeechError::Merge(_)
            | LeechError::UnsupportedProtocol(_)
            | LeechError::Config(_)
            | LeechError::Unknown(_) => ErrorKind::Unclassified,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// 返回码，仅协议错误有
    pub fn reply_code(&self) -> Option<u32> {
        match self {
            LeechError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<String> for LeechError {
    fn from(error: String) -> Self {
        LeechError::Unknown(error)
    }
}

impl From<&str> for LeechError {
    fn from(error: &str) -> Self {
        LeechError::Unknown(error.to_string())
    }
}

pub type LeechResult<T> = Result<T, LeechError>;
