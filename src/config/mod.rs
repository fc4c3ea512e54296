use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::builder::TaskSettings;
use crate::core::error::{LeechError, LeechResult};
use crate::utils::validator;
use crate::core::task::{
    ConnectionMode, ConnectionParams, FileTemplate, MergeOptions, RetryPolicy, TransferType,
};

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 分片大小（字节）
    pub piece_size: u64,
    /// 读取缓冲区大小（字节）
    pub buffer_size: usize,
    /// 是否续传已有的本地文件
    pub resume: bool,
    /// 同时运行的分片数
    pub working_threads: usize,
    /// 单文件命名模板
    pub single_file_template: String,
    /// 分片文件命名模板
    pub multi_file_template: String,
    /// 默认端口
    pub port: u16,
    /// 用户名，空表示匿名
    pub username: String,
    pub password: String,
    /// 被动模式
    pub passive: bool,
    /// binary 或 ascii
    pub transfer_type: TransferType,
    /// 加密传输
    pub secure: bool,
    /// 忽略证书错误
    pub ignore_cert_errors: bool,
    /// 协议错误达到该次数后放弃
    pub fatal_error_limit: u32,
    /// 重试等待（秒）
    pub retry_delay_secs: u64,
    /// 进度通知间隔（毫秒）
    pub progress_interval_ms: u64,
    /// 最后一个分片完成到开始合并的等待（毫秒）
    pub merge_delay_ms: u64,
    /// 合并后保留分片文件
    pub keep_parts: bool,
    /// 日志文件，空表示输出到终端
    pub log_file: String,
    /// error, warn, info, debug, trace
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            piece_size: 15_000_000,
            buffer_size: 65_536,
            resume: false,
            working_threads: 4,
            single_file_template: FileTemplate::SINGLE_DEFAULT.to_string(),
            multi_file_template: FileTemplate::MULTIPLE_DEFAULT.to_string(),
            port: 21,
            username: String::new(),
            password: String::new(),
            passive: true,
            transfer_type: TransferType::Binary,
            secure: false,
            ignore_cert_errors: false,
            fatal_error_limit: 5,
            retry_delay_secs: 10,
            progress_interval_ms: 1000,
            merge_delay_ms: 500,
            keep_parts: false,
            log_file: "logs/ftpleech.log".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时创建，格式错误时使用默认配置
    pub fn load(path: &str) -> LeechResult<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    eprintln!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> LeechResult<()> {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|_| LeechError::CreateFolder(parent.to_path_buf()))?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| LeechError::config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    /// 生成配置文件教程内容
    fn generate_tutorial_content() -> String {
        r#"# ftpleech 配置文件
# ====================
#
# TOML 格式，修改后保存即可。缺少的项使用默认值。
#
# 配置文件位置：
# - Windows: %APPDATA%/ftpleech/ftpleech.conf
# - macOS: ~/Library/Application Support/ftpleech/ftpleech.conf
# - Linux: ~/.config/ftpleech/ftpleech.conf
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   ftpleech file:///srv/mirror/kernel.img                 # 从本地目录下载
#   ftpleech -t 8 sim://demo/big.bin?size=100000000        # 模拟服务器，8 个分片同时下载
#   ftpleech -p 5000000 -d /tmp/out file:///srv/mirror/    # 下载整个目录，5MB 分片
#   ftpleech -f sources.txt                                # 从文件读取下载源
#   ftpleech -e                                            # 编辑配置文件
#
# 运行中按键：p 暂停全部，r 恢复全部，+/- 调整并发数，q 退出
#
# ==================== 配置项说明 ====================
#
# download_dir          下载目录
# piece_size            分片大小（字节），大于该值的文件被拆成多个分片并行下载
# buffer_size           读取缓冲区（字节）
# resume                续传已存在的本地文件；关闭时重新下载
# working_threads       同时运行的分片数
# single_file_template  单文件命名，可用 {dir} {name}
# multi_file_template   分片文件命名，可用 {dir} {name} {part}，{part:03} 表示补零到三位
# port                  默认端口（URL 中未指定时使用）
# username / password   登录账号，都为空表示匿名
# passive               被动模式
# transfer_type         binary 或 ascii
# secure                加密传输
# ignore_cert_errors    加密传输时忽略证书错误
# fatal_error_limit     协议错误（登录失败、文件不存在等）重试次数上限
# retry_delay_secs      每次重试前的等待（秒），网络错误无限重试
# progress_interval_ms  进度刷新间隔（毫秒）
# merge_delay_ms        分片全部完成后开始合并前的等待（毫秒）
# keep_parts            合并后保留分片文件
# log_file              日志文件，为空时输出到终端（RUST_LOG 可覆盖级别）
# log_level             日志级别：error warn info debug trace
#
# ==================== 故障排除 ====================
#
# 问题：反复出现 NOT_LOGGED_IN (530)
# 解决：检查 username 和 password，匿名服务器两者都留空
#
# 问题：下载中断后从头开始
# 解决：设置 resume = true
#
# 问题：分片文件残留
# 解决：合并失败时分片会保留，检查日志后重新运行
"#
        .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> LeechResult<()> {
        if self.download_dir.is_empty() {
            return Err(LeechError::config("下载目录不能为空"));
        }
        validator::validate_piece_size(self.piece_size).map_err(|e| LeechError::config(e.to_string()))?;
        if self.buffer_size == 0 {
            return Err(LeechError::config("缓冲区大小必须大于0"));
        }
        validator::validate_thread_count(self.working_threads).map_err(|e| LeechError::config(e.to_string()))?;
        if self.fatal_error_limit == 0 {
            return Err(LeechError::config("协议错误重试次数必须大于0"));
        }
        if self.username.is_empty() != self.password.is_empty() {
            return Err(LeechError::config("用户名和密码必须同时设置"));
        }
        FileTemplate::new(self.single_file_template.as_str()).validate(false)?;
        FileTemplate::new(self.multi_file_template.as_str()).validate(true)?;
        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(threads) = args.working_threads {
            self.working_threads = threads;
        }
        if let Some(piece_size) = args.piece_size {
            self.piece_size = piece_size;
        }
        if let Some(buffer_size) = args.buffer_size {
            self.buffer_size = buffer_size;
        }
        if args.resume {
            self.resume = true;
        }
        if args.keep_parts {
            self.keep_parts = true;
        }
    }

    pub fn download_path(&self) -> PathBuf {
        PathBuf::from(&self.download_dir)
    }

    /// URL 中未给出的连接参数
    pub fn connection_params(&self) -> ConnectionParams {
        let credentials = !self.username.is_empty();
        ConnectionParams {
            port: self.port,
            username: credentials.then(|| self.username.clone()),
            password: credentials.then(|| self.password.clone()),
            mode: if self.passive {
                ConnectionMode::Passive
            } else {
                ConnectionMode::Active
            },
            transfer_type: self.transfer_type,
            secure: self.secure,
            ignore_cert_errors: self.ignore_cert_errors,
            ..ConnectionParams::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            fatal_error_limit: self.fatal_error_limit,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            unwind_delay: Duration::from_millis(self.merge_delay_ms),
            keep_parts: self.keep_parts,
            ..MergeOptions::default()
        }
    }

    /// 某个下载源的任务设置
    pub fn task_settings(&self, connection: ConnectionParams) -> TaskSettings {
        TaskSettings {
            piece_size: self.piece_size,
            buffer_size: self.buffer_size,
            resume: self.resume,
            single_file_template: FileTemplate::new(self.single_file_template.as_str()),
            multi_file_template: FileTemplate::new(self.multi_file_template.as_str()),
            connection,
            policy: self.retry_policy(),
        }
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 分片大小: {}\n\
            - 并发数: {}\n\
            - 缓冲区: {}\n\
            - 断点续传: {}\n\
            - 账号: {}\n\
            - 协议错误重试: {} 次，间隔 {} 秒\n\
            - 保留分片: {}",
            self.download_dir,
            crate::ui::format_size(self.piece_size),
            self.working_threads,
            crate::ui::format_size(self.buffer_size as u64),
            if self.resume { "启用" } else { "禁用" },
            if self.username.is_empty() { "匿名" } else { self.username.as_str() },
            self.fatal_error_limit,
            self.retry_delay_secs,
            if self.keep_parts { "是" } else { "否" }
        )
    }
}
