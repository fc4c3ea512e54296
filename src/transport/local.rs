//! 本地目录传输：把本地（或挂载的网络）目录当作远程根目录

use log::debug;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use super::reply;
use super::{ByteStream, Connector, RemoteEntry, Transport};
use crate::core::error::LeechResult;
use crate::core::task::context::{ConnectionMode, ConnectionParams, TransferType};

pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Connector for LocalConnector {
    fn create(&self, params: &ConnectionParams) -> LeechResult<Box<dyn Transport>> {
        if params.secure {
            debug!("[file] 本地传输忽略加密设置");
        }
        Ok(Box::new(LocalTransport {
            root: self.root.clone(),
            reply: reply::SERVICE_READY,
            reply_text: String::new(),
            connected: false,
        }))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

struct LocalTransport {
    root: PathBuf,
    reply: u32,
    reply_text: String,
    connected: bool,
}

impl LocalTransport {
    /// 远程路径映射到根目录下，拒绝 `..` 越界
    fn resolve(&self, remote_path: &str) -> Option<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(remote_path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }

    fn set_reply(&mut self, code: u32, text: impl Into<String>) {
        self.reply = code;
        self.reply_text = text.into();
    }

    fn unavailable(&mut self, remote_path: &str) {
        self.set_reply(
            reply::FILE_UNAVAILABLE,
            format!("550 {}: no such file or directory", remote_path),
        );
    }
}

impl Transport for LocalTransport {
    fn connect(&mut self, _host: &str, _port: u16) -> io::Result<()> {
        if !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("根目录不存在: {}", self.root.display()),
            ));
        }
        self.connected = true;
        self.set_reply(reply::SERVICE_READY, "220 local transport ready");
        Ok(())
    }

    fn login(&mut self, _user: &str, _password: &str) -> io::Result<bool> {
        self.set_reply(reply::USER_LOGGED_IN, "230 logged in");
        Ok(true)
    }

    fn set_transfer_type(&mut self, _transfer_type: TransferType) -> io::Result<bool> {
        self.set_reply(reply::COMMAND_OK, "200 type set");
        Ok(true)
    }

    fn set_mode(&mut self, _mode: ConnectionMode) {}

    fn open_read_stream(&mut self, remote_path: &str, offset: u64) -> io::Result<Option<ByteStream>> {
        let Some(path) = self.resolve(remote_path).filter(|p| p.is_file()) else {
            self.unavailable(remote_path);
            return Ok(None);
        };
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        self.set_reply(reply::FILE_STATUS_OK, "150 opening data connection");
        Ok(Some(Box::new(file)))
    }

    fn list_entries(&mut self, remote_path: &str) -> io::Result<Vec<RemoteEntry>> {
        let Some(path) = self.resolve(remote_path).filter(|p| p.exists()) else {
            self.unavailable(remote_path);
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        if path.is_file() {
            entries.push(RemoteEntry {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: fs::metadata(&path)?.len(),
                is_directory: false,
            });
        } else {
            for entry in fs::read_dir(&path)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                entries.push(RemoteEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    is_directory: meta.is_dir(),
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.set_reply(reply::CLOSING_DATA_CONNECTION, "226 transfer complete");
        Ok(entries)
    }

    fn reply_code(&self) -> u32 {
        self.reply
    }

    fn reply_string(&self) -> String {
        self.reply_text.clone()
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.connected = false;
        Ok(())
    }
}
