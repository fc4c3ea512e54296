//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析和验证
//! - 配置文件路径管理
//! - 下载源列表处理（命令行参数和文件）
//! - 配置文件编辑器集成
//!
//! ## 支持的命令
//!
//! - 基本下载：`ftpleech <source>`
//! - 批量下载：`ftpleech -f sources.txt`
//! - 编辑配置：`ftpleech -e`
//! - 指定配置：`ftpleech -c ftpleech.conf <source>`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/ftpleech/ftpleech.conf`
//! - macOS: `~/Library/Application Support/ftpleech/ftpleech.conf`
//! - Linux: `~/.config/ftpleech/ftpleech.conf`

use clap::Parser;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::core::error::{LeechError, LeechResult};
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/ftpleech/ftpleech.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/ftpleech/ftpleech.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/ftpleech/ftpleech.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 $EDITOR，其次 xdg-open，最后 nano
        let editor = env::var("EDITOR").ok();
        let opened = editor
            .map(|e| std::process::Command::new(e).arg(config_path).status().is_ok())
            .unwrap_or(false);
        if !opened && std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// ftpleech 命令行参数
///
/// 示例用法：
///   ftpleech file:///srv/mirror/kernel.img
///   ftpleech -e  # 编辑配置文件
///   ftpleech -t 8 -p 5000000 sim://demo/big.bin?size=100000000
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ftpleech",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "一个用 Rust 编写的分片并发文件下载器",
    long_about = "把远程文件切成分片并发下载，失败自动重试，完成后按顺序合并。\n\n示例：\n  ftpleech file:///srv/mirror/kernel.img\n  ftpleech -e\n  ftpleech -t 8 -p 5000000 sim://demo/big.bin?size=100000000\n\n运行中按键：p 暂停，r 恢复，+/- 调整并发数，q 退出\n"
)]
pub struct Args {
    /// 下载源（可同时指定多个）
    #[arg(required = false, help = "下载源 URL，支持 file:// 和 sim://，可以同时指定多个。")]
    pub sources: Vec<String>,

    /// 包含下载源列表的文件路径
    #[arg(short, long, help = "包含下载源列表的文件路径，每行一个，# 开头为注释。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 指定下载目录
    #[arg(long, short = 'd', help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 同时运行的分片数
    #[arg(long = "threads", short = 't', help = "同时运行的分片数，覆盖配置文件中的设置。")]
    pub working_threads: Option<usize>,

    /// 分片大小（字节）
    #[arg(long, short = 'p', help = "分片大小（字节），覆盖配置文件中的设置。")]
    pub piece_size: Option<u64>,

    /// 读取缓冲区大小（字节）
    #[arg(long = "buffer", short = 'b', help = "读取缓冲区大小（字节）。")]
    pub buffer_size: Option<usize>,

    #[arg(long, help = "续传已存在的本地文件。")]
    pub resume: bool,

    #[arg(long, help = "合并后保留分片文件。")]
    pub keep_parts: bool,
}

impl Args {
    /// 解析命令行参数，加载配置并合并
    pub fn parse_args() -> LeechResult<(Self, Config)> {
        let args = Args::parse();
        let config = args.load_config()?;
        Ok((args, config))
    }

    /// 加载或创建配置文件，合并命令行参数后校验
    pub fn load_config(&self) -> LeechResult<Config> {
        let mut config = Config::load(&self.config)
            .map_err(|e| LeechError::config(format!("无法读取配置文件 {}: {}", self.config, e)))?;

        config.merge_from_args(self);

        config
            .validate()
            .map_err(|e| LeechError::config(format!("配置无效: {}", e)))?;
        Ok(config)
    }

    /// 收集命令行和文件中的下载源
    pub fn get_sources(&self) -> LeechResult<Vec<String>> {
        let mut sources = Vec::new();
        sources.extend_from_slice(&self.sources);

        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                return Err(LeechError::config(format!("下载源文件不存在: {}", file_path)));
            }
            let content = fs::read_to_string(file_path)?;

            // 按行读取，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    sources.push(line.to_string());
                }
            }
        }

        validator::validate_sources(&sources).map_err(|e| LeechError::config(e.to_string()))?;
        Ok(sources)
    }
}
