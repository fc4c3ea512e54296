use indicatif::{ProgressBar, ProgressStyle};

use crate::core::scheduler::Statistics;
use crate::core::task::{NotificationAdapter, PieceState, PieceWorker};
use crate::ui::{format_eta, format_speed};

/// 状态栏文字
pub fn status_line(stats: &Statistics, working_threads: usize, paused: bool) -> String {
    let mut line = format!(
        "{}/{} 运行 | {} 排队 | {} | ETA:{}",
        stats.active,
        working_threads,
        stats.queued,
        format_speed(stats.speed),
        format_eta(stats.eta)
    );
    if stats.failed > 0 {
        line.push_str(&format!(" | {} 失败", stats.failed));
    }
    if paused {
        line.push_str(" | 已暂停");
    }
    line
}

/// 汇总进度条，同时作为调度器的通知适配器打印完成和失败的文件
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        Self::with_bar(ProgressBar::new(0).with_style(style))
    }

    /// 不输出到终端
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self { bar }
    }

    pub fn update(&self, stats: &Statistics, working_threads: usize, paused: bool) {
        self.bar.set_length(stats.total);
        self.bar.set_position(stats.downloaded);
        self.bar.set_message(status_line(stats, working_threads, paused));
    }

    pub fn println(&self, message: impl AsRef<str>) {
        self.bar.println(message);
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationAdapter for ProgressManager {
    fn on_bulk_change(&self) {
        // 总量变化后重新估算剩余时间
        self.bar.reset_eta();
    }

    fn on_item_change(&self, piece: &PieceWorker) {
        let info = piece.piece_context();
        match piece.state() {
            // 文件完成时每个分片都会变为 Finished，只打印第一个
            PieceState::Finished if info.part == 0 => {
                self.bar.println(format!("✓ {}", info.remote_path));
            }
            PieceState::FatalError => {
                let reason = piece
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "未知错误".to_string());
                self.bar.println(format!("✗ {}: {}", piece.name(), reason));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_line() {
        let stats = Statistics {
            speed: 2048,
            total: 1000,
            downloaded: 500,
            remaining: 500,
            eta: Duration::from_secs(90),
            active: 2,
            queued: 3,
            finished: 1,
            failed: 0,
        };
        assert_eq!(status_line(&stats, 4, false), "2/4 运行 | 3 排队 | 2.00 KB/s | ETA:1m30s");

        let stats = Statistics { failed: 1, ..stats };
        let line = status_line(&stats, 4, true);
        assert!(line.ends_with("| 1 失败 | 已暂停"));
    }

    #[test]
    fn test_hidden_progress_update() {
        let progress = ProgressManager::hidden();
        let stats = Statistics {
            total: 100,
            downloaded: 40,
            ..Statistics::default()
        };
        progress.update(&stats, 2, false);
        assert_eq!(progress.bar.position(), 40);
        assert_eq!(progress.bar.length(), Some(100));
        progress.finish();
    }
}
