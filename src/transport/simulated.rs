//! 进程内模拟服务器
//!
//! 与真实服务器行为一致：流从偏移处一直读到文件尾（不关心分片边界），
//! 返回码 >= 300 表示失败。可注入登录失败、连接失败、读取中断、提前结束等故障，
//! 供单元测试和 `sim://` 演示源使用。

use log::debug;
use rand::{Rng, RngCore};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::reply;
use super::{ByteStream, Connector, RemoteEntry, Transport};
use crate::core::error::LeechResult;
use crate::core::task::context::{ConnectionMode, ConnectionParams, TransferType};

/// `sim://` 源未指定大小时的文件大小
pub const DEFAULT_FILE_SIZE: u64 = 40_000_000;

/// 服务器统计，测试用
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections: usize,
    pub disconnects: usize,
    pub logins: usize,
    pub streams_opened: usize,
    /// 每次打开流时请求的偏移
    pub offsets: Vec<u64>,
    /// 当前同时打开的连接数
    pub open_connections: usize,
    /// 同时打开连接数的峰值
    pub peak_connections: usize,
}

#[derive(Debug)]
struct ServerState {
    files: BTreeMap<String, Arc<Vec<u8>>>,
    login_reply: u32,
    accept_transfer_type: bool,
    open_reply: Option<u32>,
    connect_failures: u32,
    /// 每个流在读出多少字节后出错，按打开顺序消费
    stream_failures: VecDeque<u64>,
    /// 每个流在多少字节后提前结束，按打开顺序消费
    truncations: VecDeque<u64>,
    read_chunk: usize,
    read_delay: Duration,
    /// 每次读取以该概率模拟一次网络中断（演示用）
    fault_rate: f64,
    stats: ServerStats,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            login_reply: reply::USER_LOGGED_IN,
            accept_transfer_type: true,
            open_reply: None,
            connect_failures: 0,
            stream_failures: VecDeque::new(),
            truncations: VecDeque::new(),
            read_chunk: usize::MAX,
            read_delay: Duration::ZERO,
            fault_rate: 0.0,
            stats: ServerStats::default(),
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// 可克隆的服务器句柄，所有克隆共享同一状态
#[derive(Debug, Clone, Default)]
pub struct SimulatedServer {
    state: Arc<Mutex<ServerState>>,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 演示服务器：随机内容、限速、偶发网络中断
    pub fn demo(path: &str, size: u64) -> Self {
        let server = Self::new();
        server.add_random_file(path, size);
        server.set_read_throttle(64 * 1024, Duration::from_millis(5));
        server.set_fault_rate(0.0005);
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.lock().files.insert(normalize(path), Arc::new(data));
    }

    pub fn add_random_file(&self, path: &str, size: u64) -> Arc<Vec<u8>> {
        let mut data = vec![0u8; size as usize];
        rand::thread_rng().fill_bytes(&mut data);
        let data = Arc::new(data);
        self.lock().files.insert(normalize(path), data.clone());
        data
    }

    pub fn set_login_reply(&self, code: u32) {
        self.lock().login_reply = code;
    }

    pub fn set_accept_transfer_type(&self, accept: bool) {
        self.lock().accept_transfer_type = accept;
    }

    /// 强制打开流时返回指定返回码
    pub fn set_open_reply(&self, code: Option<u32>) {
        self.lock().open_reply = code;
    }

    /// 接下来 `count` 次连接失败（IO 错误）
    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// 下一个打开的流在读出 `after` 字节后出现 IO 错误
    pub fn fail_stream_after(&self, after: u64) {
        self.lock().stream_failures.push_back(after);
    }

    /// 下一个打开的流在 `after` 字节后提前结束
    pub fn truncate_stream_after(&self, after: u64) {
        self.lock().truncations.push_back(after);
    }

    pub fn set_read_throttle(&self, chunk: usize, delay: Duration) {
        let mut state = self.lock();
        state.read_chunk = chunk.max(1);
        state.read_delay = delay;
    }

    pub fn set_fault_rate(&self, rate: f64) {
        self.lock().fault_rate = rate;
    }

    pub fn stats(&self) -> ServerStats {
        self.lock().stats.clone()
    }
}

pub struct SimulatedConnector {
    server: SimulatedServer,
}

impl SimulatedConnector {
    pub fn new(server: SimulatedServer) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &SimulatedServer {
        &self.server
    }
}

impl Connector for SimulatedConnector {
    fn create(&self, _params: &ConnectionParams) -> LeechResult<Box<dyn Transport>> {
        Ok(Box::new(SimulatedTransport {
            server: self.server.clone(),
            reply: reply::SERVICE_READY,
            reply_text: String::new(),
            connected: false,
        }))
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

struct SimulatedTransport {
    server: SimulatedServer,
    reply: u32,
    reply_text: String,
    connected: bool,
}

impl SimulatedTransport {
    fn set_reply(&mut self, code: u32, text: impl Into<String>) {
        self.reply = code;
        self.reply_text = text.into();
    }

    fn ensure_connected(&self) -> io::Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
        }
    }
}

impl Transport for SimulatedTransport {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let mut state = self.server.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("{}:{} refused", host, port)));
        }
        state.stats.connections += 1;
        state.stats.open_connections += 1;
        state.stats.peak_connections = state.stats.peak_connections.max(state.stats.open_connections);
        drop(state);
        self.connected = true;
        self.set_reply(reply::SERVICE_READY, "220 simulated server ready");
        Ok(())
    }

    fn login(&mut self, user: &str, _password: &str) -> io::Result<bool> {
        self.ensure_connected()?;
        let code = {
            let mut state = self.server.lock();
            state.stats.logins += 1;
            state.login_reply
        };
        self.set_reply(code, format!("{} login {}", code, user));
        Ok(!reply::is_failure(code))
    }

    fn set_transfer_type(&mut self, transfer_type: TransferType) -> io::Result<bool> {
        self.ensure_connected()?;
        let accept = self.server.lock().accept_transfer_type;
        if accept {
            self.set_reply(reply::COMMAND_OK, format!("200 type set to {:?}", transfer_type));
        } else {
            self.set_reply(reply::COMMAND_NOT_IMPLEMENTED_FOR_PARAMETER, "504 type refused");
        }
        Ok(accept)
    }

    fn set_mode(&mut self, mode: ConnectionMode) {
        debug!("[sim] mode {:?}", mode);
    }

    fn open_read_stream(&mut self, remote_path: &str, offset: u64) -> io::Result<Option<ByteStream>> {
        self.ensure_connected()?;
        let mut state = self.server.lock();
        if let Some(code) = state.open_reply {
            drop(state);
            self.set_reply(code, format!("{} refused", code));
            return Ok(None);
        }
        let found = state.files.get(&normalize(remote_path)).cloned();
        let data = match found {
            Some(data) => data,
            None => {
                drop(state);
                self.set_reply(reply::FILE_UNAVAILABLE, format!("550 {}: no such file", remote_path));
                return Ok(None);
            }
        };
        state.stats.streams_opened += 1;
        state.stats.offsets.push(offset);
        let fail_after = state.stream_failures.pop_front();
        let truncate = state.truncations.pop_front();
        let start = (offset as usize).min(data.len());
        let end = match truncate {
            Some(t) => (start + t as usize).min(data.len()),
            None => data.len(),
        };
        let stream = SimulatedStream {
            data,
            pos: start,
            end,
            fail_after,
            chunk: state.read_chunk,
            delay: state.read_delay,
            fault_rate: state.fault_rate,
        };
        drop(state);
        self.set_reply(reply::FILE_STATUS_OK, "150 opening data connection");
        Ok(Some(Box::new(stream)))
    }

    fn list_entries(&mut self, path: &str) -> io::Result<Vec<RemoteEntry>> {
        self.ensure_connected()?;
        let path = normalize(path);
        let state = self.server.lock();
        if let Some(size) = state.files.get(&path).map(|d| d.len() as u64) {
            drop(state);
            let entry = RemoteEntry {
                name: path.rsplit('/').next().unwrap_or_default().to_string(),
                size,
                is_directory: false,
            };
            self.set_reply(reply::CLOSING_DATA_CONNECTION, "226 transfer complete");
            return Ok(vec![entry]);
        }

        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();
        for (key, data) in state.files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else { break };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(dir.to_string());
                }
                None => files.push(RemoteEntry {
                    name: rest.to_string(),
                    size: data.len() as u64,
                    is_directory: false,
                }),
            }
        }
        drop(state);

        if files.is_empty() && dirs.is_empty() {
            self.set_reply(reply::FILE_UNAVAILABLE, format!("550 {}: no such file or directory", path));
            return Ok(Vec::new());
        }
        let mut entries: Vec<RemoteEntry> = dirs
            .into_iter()
            .map(|name| RemoteEntry {
                name,
                size: 0,
                is_directory: true,
            })
            .collect();
        entries.extend(files);
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
        if self.connected {
            self.connected = false;
            let mut state = self.server.lock();
            state.stats.disconnects += 1;
            state.stats.open_connections = state.stats.open_connections.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

struct SimulatedStream {
    data: Arc<Vec<u8>>,
    pos: usize,
    end: usize,
    fail_after: Option<u64>,
    chunk: usize,
    delay: Duration,
    fault_rate: f64,
}

impl Read for SimulatedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_after == Some(0) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }
        if self.fault_rate > 0.0 && rand::thread_rng().gen_bool(self.fault_rate) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated read timeout"));
        }
        let mut n = buf.len().min(self.chunk).min(self.end - self.pos);
        if let Some(remaining) = self.fail_after.as_mut() {
            n = n.min(*remaining as usize);
            *remaining -= n as u64;
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(server: &SimulatedServer) -> Box<dyn Transport> {
        let mut t = SimulatedConnector::new(server.clone())
            .create(&ConnectionParams::default())
            .unwrap();
        t.connect("localhost", 21).unwrap();
        t
    }

    #[test]
    fn test_stream_from_offset() {
        let server = SimulatedServer::new();
        server.add_file("/pub/a.bin", (0u8..100).collect());
        let mut t = connected(&server);
        let mut stream = t.open_read_stream("/pub/a.bin", 90).unwrap().unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, (90u8..100).collect::<Vec<_>>());
        assert_eq!(server.stats().offsets, vec![90]);
    }

    #[test]
    fn test_missing_file_reply() {
        let server = SimulatedServer::new();
        let mut t = connected(&server);
        assert!(t.open_read_stream("/nope", 0).unwrap().is_none());
        assert_eq!(t.reply_code(), reply::FILE_UNAVAILABLE);
    }

    #[test]
    fn test_stream_failure_injection() {
        let server = SimulatedServer::new();
        server.add_file("/a", vec![1u8; 100]);
        server.fail_stream_after(10);
        let mut t = connected(&server);
        let mut stream = t.open_read_stream("/a", 0).unwrap().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(stream.read(&mut buf).unwrap(), 10);
        assert!(stream.read(&mut buf).is_err());
    }

    #[test]
    fn test_list_entries() {
        let server = SimulatedServer::new();
        server.add_file("/pub/a.bin", vec![0; 10]);
        server.add_file("/pub/sub/b.bin", vec![0; 20]);
        let mut t = connected(&server);

        let entries = t.list_entries("/pub").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name == "sub" && e.is_directory));
        assert!(entries.iter().any(|e| e.name == "a.bin" && e.size == 10));

        let single = t.list_entries("/pub/sub/b.bin").unwrap();
        assert_eq!(single, vec![RemoteEntry { name: "b.bin".into(), size: 20, is_directory: false }]);

        assert!(t.list_entries("/missing").unwrap().is_empty());
        assert!(reply::is_failure(t.reply_code()));
    }

    #[test]
    fn test_connection_accounting() {
        let server = SimulatedServer::new();
        {
            let _a = connected(&server);
            let _b = connected(&server);
            assert_eq!(server.stats().open_connections, 2);
        }
        let stats = server.stats();
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.peak_connections, 2);
        assert_eq!(stats.disconnects, 2);
    }
}
