use std::time::Duration;

use crate::core::error::LeechError;

/// 重试策略
///
/// 协议错误累计到 `fatal_error_limit` 次后放弃，IO 错误无限重试，两者都固定等待 `retry_delay`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub fatal_error_limit: u32,
    pub retry_delay: Duration,
    /// 进度通知的最小间隔
    pub progress_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            fatal_error_limit: 5,
            retry_delay: Duration::from_secs(10),
            progress_interval: Duration::from_millis(1000),
        }
    }
}

/// 一次失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后重试
    Retry,
    /// 进入 FatalError，不再重试
    GiveUp,
    /// 停在 Error，等待外部唤醒
    Park,
}

/// 重试上下文，每次下载线程启动时新建
#[derive(Debug, Default)]
pub struct RetryContext {
    pub fatal_errors: u32,
    pub transient_errors: u64,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, policy: &RetryPolicy, error: &LeechError) -> RetryDecision {
        if error.is_retryable() {
            self.transient_errors += 1;
            RetryDecision::Retry
        } else if error.is_fatal() {
            self.fatal_errors += 1;
            if self.fatal_errors >= policy.fatal_error_limit {
                RetryDecision::GiveUp
            } else {
                RetryDecision::Retry
            }
        } else {
            RetryDecision::Park
        }
    }
}
