use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::core::error::{LeechError, LeechResult};

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    #[default]
    Binary,
    Ascii,
}

/// 连接模式（被动/主动）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Passive,
    Active,
}

/// 连接参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mode: ConnectionMode,
    pub transfer_type: TransferType,
    /// 是否使用加密传输
    pub secure: bool,
    /// 加密传输时忽略证书校验失败
    pub ignore_cert_errors: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            username: None,
            password: None,
            mode: ConnectionMode::Passive,
            transfer_type: TransferType::Binary,
            secure: false,
            ignore_cert_errors: false,
        }
    }
}

impl ConnectionParams {
    /// 用户名和密码必须同时存在或同时为空
    pub fn validate(&self) -> LeechResult<()> {
        if self.username.is_some() != self.password.is_some() {
            return Err(LeechError::config("用户名和密码必须同时设置"));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{(dir|name|part)(?::0(\d+))?\}").expect("placeholder regex is valid")
    })
}

/// 本地文件名模板
///
/// 支持 `{dir}`、`{name}`、`{part}` 以及补零的 `{part:03}` 占位符。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTemplate(String);

impl FileTemplate {
    pub const SINGLE_DEFAULT: &'static str = "{dir}/{name}";
    pub const MULTIPLE_DEFAULT: &'static str = "{dir}/{name}.part{part:03}";

    pub fn new(template: impl Into<String>) -> Self {
        FileTemplate(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self, require_part: bool) -> LeechResult<()> {
        let mut has_dir = false;
        let mut has_name = false;
        let mut has_part = false;
        for caps in placeholder_regex().captures_iter(&self.0) {
            match &caps[1] {
                "dir" => has_dir = true,
                "name" => has_name = true,
                _ => has_part = true,
            }
        }
        if !has_dir || !has_name {
            return Err(LeechError::config(format!(
                "文件模板必须包含 {{dir}} 和 {{name}}: {}",
                self.0
            )));
        }
        if require_part && !has_part {
            return Err(LeechError::config(format!(
                "分片文件模板必须包含 {{part}}: {}",
                self.0
            )));
        }
        Ok(())
    }

    pub fn render(&self, dir: &Path, name: &str, part: usize) -> PathBuf {
        let dir = dir.to_string_lossy();
        let rendered = placeholder_regex().replace_all(&self.0, |caps: &Captures| match &caps[1] {
            "dir" => dir.to_string(),
            "name" => name.to_string(),
            _ => {
                let width = caps
                    .get(2)
                    .and_then(|w| w.as_str().parse::<usize>().ok())
                    .unwrap_or(0);
                format!("{:0width$}", part, width = width)
            }
        });
        PathBuf::from(rendered.into_owned())
    }
}

/// 单个分片的下载上下文，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceContext {
    /// 远程文件完整路径，例如 `/folder1/folder2/kernel.img`
    pub remote_path: String,
    /// 远程文件名
    pub file_name: String,
    pub group_id: u64,
    /// 分片序号，从 0 开始
    pub part: usize,
    /// 分片总数
    pub parts: usize,
    /// 名义分片长度，用于计算远程偏移
    pub global_piece_length: u64,
    /// 当前分片的实际长度（最后一片可能更短）
    pub piece_length: u64,
    pub output_dir: PathBuf,
    pub single_file_template: FileTemplate,
    pub multi_file_template: FileTemplate,
    pub buffer_size: usize,
    pub resume: bool,
    pub connection: ConnectionParams,
}

impl PieceContext {
    pub fn is_multipart(&self) -> bool {
        self.parts > 1
    }

    fn remote_basename(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.file_name)
    }

    /// 分片对应的本地文件
    pub fn local_file(&self) -> PathBuf {
        let name = self.remote_basename();
        if self.is_multipart() {
            self.multi_file_template.render(&self.output_dir, name, self.part)
        } else {
            self.single_file_template.render(&self.output_dir, name, self.part)
        }
    }

    /// 合并后的最终文件
    pub fn output_file(&self) -> PathBuf {
        self.single_file_template
            .render(&self.output_dir, self.remote_basename(), 0)
    }

    /// 远程读取起点 = 分片序号 × 名义分片长度 + 已下载长度
    pub fn remote_offset(&self, already_downloaded: u64) -> u64 {
        self.part as u64 * self.global_piece_length + already_downloaded
    }

    pub fn display_name(&self) -> String {
        if self.is_multipart() {
            format!("{} {:03}", self.file_name, self.part)
        } else {
            self.file_name.clone()
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(dir: &Path, name: &str, part: usize, parts: usize, length: u64) -> PieceContext {
    PieceContext {
        remote_path: format!("/pub/{}", name),
        file_name: name.to_string(),
        group_id: 1,
        part,
        parts,
        global_piece_length: length,
        piece_length: length,
        output_dir: dir.to_path_buf(),
        single_file_template: FileTemplate::new(FileTemplate::SINGLE_DEFAULT),
        multi_file_template: FileTemplate::new(FileTemplate::MULTIPLE_DEFAULT),
        buffer_size: 64 * 1024,
        resume: false,
        connection: ConnectionParams::default(),
    }
}
