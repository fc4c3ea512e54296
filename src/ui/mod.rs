mod progress;

use std::fmt;
use std::time::Duration;

use crate::core::task::DownloadTask;
pub use progress::{status_line, ProgressManager};

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_error(message: &str) {
    println!("✗ {}", message);
}

pub struct DownloadSummary {
    pub total_files: usize,
    pub total_size: u64,
    pub elapsed_time: Duration,
    pub success_count: usize,
    pub failed_count: usize,
}

impl DownloadSummary {
    /// 统计任务结果，未完成的任务计为失败
    pub fn from_tasks(tasks: &[DownloadTask], elapsed_time: Duration) -> Self {
        let success_count = tasks.iter().filter(|t| t.is_finished()).count();
        Self {
            total_files: tasks.len(),
            total_size: tasks.iter().map(|t| t.total_length()).sum(),
            elapsed_time,
            success_count,
            failed_count: tasks.len() - success_count,
        }
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n下载摘要:")?;
        writeln!(f, "总文件数: {}", self.total_files)?;
        writeln!(f, "总大小: {}", format_size(self.total_size))?;
        writeln!(f, "耗时: {:.2}秒", self.elapsed_time.as_secs_f64())?;
        writeln!(f, "成功: {}", self.success_count)?;
        writeln!(f, "失败: {}", self.failed_count)?;
        Ok(())
    }
}

pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(speed: u64) -> String {
    if speed > 1024 * 1024 {
        format!("{:.2} MB/s", speed as f64 / (1024.0 * 1024.0))
    } else if speed > 1024 {
        format!("{:.2} KB/s", speed as f64 / 1024.0)
    } else {
        format!("{} B/s", speed)
    }
}

/// 剩余时间，零表示未知
pub fn format_eta(eta: Duration) -> String {
    let seconds = eta.as_secs();
    if eta.is_zero() {
        "未知".to_string()
    } else if seconds > 3600 {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds > 60 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(15_000_000), "14.31 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024 * 1024), "5120.00 GB");
    }

    #[test]
    fn test_format_speed_and_eta() {
        assert_eq!(format_speed(512), "512 B/s");
        assert_eq!(format_speed(2048), "2.00 KB/s");
        assert_eq!(format_speed(3 * 1024 * 1024), "3.00 MB/s");
        assert_eq!(format_eta(Duration::ZERO), "未知");
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_eta(Duration::from_secs(7300)), "2h1m");
    }

    #[test]
    fn test_summary_display() {
        let summary = DownloadSummary {
            total_files: 3,
            total_size: 2048,
            elapsed_time: Duration::from_millis(1500),
            success_count: 2,
            failed_count: 1,
        };
        let text = summary.to_string();
        assert!(text.contains("总文件数: 3"));
        assert!(text.contains("2.00 KB"));
        assert!(text.contains("1.50秒"));
        assert!(text.contains("失败: 1"));
    }
}
