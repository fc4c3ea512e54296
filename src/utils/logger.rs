use chrono::Local; // 用于获取本地时间
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use crate::config::Config;
use crate::core::error::{LeechError, LeechResult};

/// 日志文件轮转阈值
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

struct LogFile {
    writer: BufWriter<File>,
    file_path: String,
    max_size: u64, // 最大文件大小 (bytes)
    current_size: u64,
}

impl LogFile {
    fn open(file_path: &str) -> std::io::Result<(BufWriter<File>, u64)> {
        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok((BufWriter::new(file), size))
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> std::io::Result<()> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let (writer, size) = LogFile::open(&self.file_path)?;
            self.writer = writer;
            self.current_size = size;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.check_rotation()?;
        self.writer.write_all(line.as_bytes())?;
        self.current_size += line.len() as u64;

        // 定期刷新缓冲区
        if self.current_size % 1024 < line.len() as u64 {
            self.writer.flush()?;
        }
        Ok(())
    }
}

/// 写入文件并按大小轮转的日志实现
pub struct FileLogger {
    file: Mutex<LogFile>,
    level: LevelFilter,
}

impl FileLogger {
    pub fn new(file_path: &str, level: LevelFilter, max_size: u64) -> std::io::Result<Self> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (writer, current_size) = LogFile::open(file_path)?;

        Ok(Self {
            file: Mutex::new(LogFile {
                writer,
                file_path: file_path.to_string(),
                max_size,
                current_size,
            }),
            level,
        })
    }

    /// 写入一条日志
    pub fn write_log(&self, level: Level, target: &str, message: &str) -> std::io::Result<()> {
        if level > self.level {
            return Ok(());
        }
        let log_entry = format!(
            "{} [{}] {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            target,
            message
        );
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_line(&log_entry)
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Err(e) = self.write_log(record.level(), record.target(), &record.args().to_string()) {
            eprintln!("日志写入失败: {}", e);
        }
    }

    fn flush(&self) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = file.writer.flush();
    }
}

/// 解析日志级别，无法识别时使用 info
pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

/// 初始化日志：配置了日志文件时写文件，否则使用 env_logger
pub fn init(config: &Config) -> LeechResult<()> {
    let level = parse_level(&config.log_level);
    if config.log_file.is_empty() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
            .try_init()
            .map_err(|e| LeechError::config(format!("日志初始化失败: {}", e)))?;
        return Ok(());
    }

    let logger = FileLogger::new(&config.log_file, level, DEFAULT_MAX_SIZE)?;
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| LeechError::config(format!("日志初始化失败: {}", e)))?;
    log::set_max_level(level);
    Ok(())
}
