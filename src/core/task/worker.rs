use log::{debug, error, info, warn};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::context::PieceContext;
use super::listener::DownloadListener;
use super::retry::{RetryContext, RetryDecision, RetryPolicy};
use super::state::PieceState;
use crate::core::error::{LeechError, LeechResult};
use crate::transport::{self, ByteStream, Connector, SharedConnector, Transport};

#[derive(Debug, Default)]
struct WorkerStatus {
    state: PieceState,
    downloaded: u64,
    speed: u64,
    last_error: Option<Arc<LeechError>>,
    /// 下载线程存活
    attached: bool,
    pause_requested: bool,
    /// 下载线程已停在暂停点
    pause_parked: bool,
    state_before_pause: Option<PieceState>,
    /// 停在 Error 等待外部唤醒
    error_parked: bool,
    /// 暂停恢复后的下一次尝试保留本地文件
    force_resume: bool,
    index: usize,
    group: Option<u64>,
}

struct WorkerInner {
    context: PieceContext,
    connector: SharedConnector,
    policy: RetryPolicy,
    status: Mutex<WorkerStatus>,
    wakeup: Condvar,
    listeners: Mutex<Vec<Arc<dyn DownloadListener>>>,
}

/// 单个分片的下载线程
///
/// 句柄可以克隆，所有克隆指向同一个分片。下载在独立线程上进行，
/// 状态、进度和错误通过 [`DownloadListener`] 通知。
#[derive(Clone)]
pub struct PieceWorker {
    inner: Arc<WorkerInner>,
}

/// 一次尝试占用的连接，离开作用域时断开
struct Session {
    transport: Box<dyn Transport>,
}

impl Session {
    fn open(connector: &dyn Connector, context: &PieceContext) -> LeechResult<Self> {
        let transport = transport::open_transport(connector, &context.connection)?;
        Ok(Self { transport })
    }

    fn open_read_stream(&mut self, remote_path: &str, offset: u64) -> LeechResult<ByteStream> {
        match self.transport.open_read_stream(remote_path, offset)? {
            Some(stream) => Ok(stream),
            None => Err(LeechError::protocol(
                self.transport.reply_code(),
                self.transport.reply_string(),
            )),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.transport.disconnect() {
            debug!("断开连接失败: {}", e);
        }
    }
}

impl PieceWorker {
    pub fn new(context: PieceContext, connector: SharedConnector, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                context,
                connector,
                policy,
                status: Mutex::new(WorkerStatus::default()),
                wakeup: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, WorkerStatus> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, WorkerStatus>) -> MutexGuard<'a, WorkerStatus> {
        self.inner.wakeup.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// 配置的独立副本，修改它不影响下载
    pub fn context(&self) -> PieceContext {
        self.inner.context.clone()
    }

    pub(crate) fn piece_context(&self) -> &PieceContext {
        &self.inner.context
    }

    pub fn name(&self) -> String {
        self.inner.context.display_name()
    }

    pub fn length(&self) -> u64 {
        self.inner.context.piece_length
    }

    pub fn state(&self) -> PieceState {
        self.lock_status().state
    }

    pub fn downloaded(&self) -> u64 {
        self.lock_status().downloaded
    }

    /// 字节/秒
    pub fn speed(&self) -> u64 {
        self.lock_status().speed
    }

    pub fn last_error(&self) -> Option<Arc<LeechError>> {
        self.lock_status().last_error.clone()
    }

    pub fn index(&self) -> usize {
        self.lock_status().index
    }

    pub fn set_index(&self, index: usize) {
        self.lock_status().index = index;
    }

    pub fn group(&self) -> Option<u64> {
        self.lock_status().group
    }

    /// 归入分组，只能设置一次
    pub fn attach_group(&self, group_id: u64) -> LeechResult<()> {
        let mut st = self.lock_status();
        match st.group {
            Some(current) if current != group_id => Err(LeechError::invalid_state(format!(
                "分片 {} 已属于分组 {}，不能改为 {}",
                self.inner.context.display_name(),
                current,
                group_id
            ))),
            _ => {
                st.group = Some(group_id);
                Ok(())
            }
        }
    }

    /// 下载线程是否存活
    pub fn is_attached(&self) -> bool {
        self.lock_status().attached
    }

    /// 是否占用一个并发名额
    pub(crate) fn occupies_slot(&self) -> bool {
        let st = self.lock_status();
        st.attached && st.state.is_running()
    }

    /// 等待下载线程退出，超时返回 false
    pub fn wait_detached(&self, timeout: Duration) -> bool {
        let st = self.lock_status();
        let (st, _) = self
            .inner
            .wakeup
            .wait_timeout_while(st, timeout, |s| s.attached)
            .unwrap_or_else(|e| e.into_inner());
        !st.attached
    }

    pub fn register_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// 按对象身份注销，返回是否找到
    pub fn unregister_listener(&self, listener: &Arc<dyn DownloadListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    fn listeners(&self) -> Vec<Arc<dyn DownloadListener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn notify_state(&self, state: PieceState) {
        for listener in self.listeners() {
            listener.on_state_change(self, state);
        }
    }

    fn notify_error(&self, error: &LeechError) {
        for listener in self.listeners() {
            listener.on_error(self, error);
        }
    }

    fn notify_fatal(&self, error: &LeechError) {
        for listener in self.listeners() {
            listener.on_fatal_error(self, error);
        }
    }

    fn notify_progress(&self, downloaded: u64, rate: u64) {
        for listener in self.listeners() {
            listener.on_progress(self, downloaded, rate);
        }
    }

    /// 设置状态并通知观察者，调用时不能持有状态锁；速度清零，等下一次进度重新测量
    pub(crate) fn transition(&self, state: PieceState) {
        {
            let mut st = self.lock_status();
            st.state = state;
            st.speed = 0;
        }
        self.notify_state(state);
    }

    /// 合并失败时由合并器调用
    pub(crate) fn fail(&self, error: LeechError) {
        let error = self.record_error(error);
        self.notify_error(&error);
        self.transition(PieceState::Error);
    }

    fn record_error(&self, error: LeechError) -> Arc<LeechError> {
        let error = Arc::new(error);
        self.lock_status().last_error = Some(error.clone());
        error
    }

    fn set_downloaded(&self, downloaded: u64) {
        self.lock_status().downloaded = downloaded;
    }

    /// 在独立线程上开始下载，已在运行时返回 false
    pub fn start(&self) -> bool {
        let previous = {
            let mut st = self.lock_status();
            if st.attached {
                return false;
            }
            st.attached = true;
            st.pause_requested = false;
            st.pause_parked = false;
            st.state_before_pause = None;
            st.error_parked = false;
            st.speed = 0;
            mem::replace(&mut st.state, PieceState::Started)
        };

        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("piece-{}", self.name()))
            .spawn(move || worker.run());
        match spawned {
            Ok(_) => true,
            Err(e) => {
                error!("[{}] 无法创建下载线程: {}", self.name(), e);
                let mut st = self.lock_status();
                st.attached = false;
                st.state = previous;
                false
            }
        }
    }

    /// 从结束状态重置为 Created，下载线程仍存活时拒绝
    pub fn restart(&self) -> LeechResult<()> {
        {
            let mut st = self.lock_status();
            if st.attached {
                return Err(LeechError::invalid_state(format!(
                    "分片 {} 的下载线程仍在运行",
                    self.name()
                )));
            }
            if !st.state.is_stopped() {
                return Err(LeechError::invalid_state(format!(
                    "分片 {} 处于 {:?}，不能重新开始",
                    self.name(),
                    st.state
                )));
            }
            st.state = PieceState::Created;
            st.downloaded = 0;
            st.speed = 0;
            st.last_error = None;
            st.force_resume = false;
        }
        self.notify_state(PieceState::Created);
        Ok(())
    }

    /// 暂停或恢复
    ///
    /// 暂停立即把状态设为 Paused，但不通知；下载线程到达暂停点时才发出 Paused 通知。
    /// 恢复同时会唤醒停在 Error 的下载线程。
    pub fn set_pause(&self, pause: bool) -> LeechResult<()> {
        let mut st = self.lock_status();
        if pause {
            if st.state == PieceState::Paused {
                st.pause_requested = true;
                return Ok(());
            }
            if !st.state.is_active() {
                return Err(LeechError::invalid_state(format!(
                    "分片 {} 处于 {:?}，不能暂停",
                    self.name(),
                    st.state
                )));
            }
            st.pause_requested = true;
            st.state_before_pause = Some(st.state);
            st.state = PieceState::Paused;
            st.speed = 0;
        } else {
            let requested = mem::replace(&mut st.pause_requested, false);
            if requested && !st.pause_parked && st.state == PieceState::Paused {
                if let Some(previous) = st.state_before_pause.take() {
                    st.state = previous;
                }
            }
            st.error_parked = false;
            drop(st);
            self.inner.wakeup.notify_all();
        }
        Ok(())
    }

    fn run(&self) {
        self.notify_state(PieceState::Started);
        let mut retry = RetryContext::new();
        loop {
            let state = self.download_loop(&mut retry);
            if state.is_stopped() {
                break;
            }
            let error = self.record_error(LeechError::invalid_state(format!(
                "下载循环在 {:?} 状态退出",
                state
            )));
            error!("[{}] {}", self.name(), error);
            self.transition(PieceState::Error);
        }

        {
            let mut st = self.lock_status();
            st.attached = false;
            st.speed = 0;
        }
        self.inner.wakeup.notify_all();
        debug!("[{}] 下载线程退出", self.name());
    }

    fn download_loop(&self, retry: &mut RetryContext) -> PieceState {
        let policy = &self.inner.policy;
        loop {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.attempt()))
                .unwrap_or_else(|_| Err(LeechError::Unknown("下载线程崩溃".to_string())));
            let error = match result {
                Ok(state) => return state,
                Err(error) => error,
            };

            let decision = retry.record(policy, &error);
            let error = self.record_error(error);
            match decision {
                RetryDecision::Retry => {
                    if error.is_fatal() {
                        warn!(
                            "[{}] 协议错误 ({}/{}): {}",
                            self.name(),
                            retry.fatal_errors,
                            policy.fatal_error_limit,
                            error
                        );
                        self.notify_fatal(&error);
                    } else {
                        warn!(
                            "[{}] 下载出错，{:?} 后重试: {}",
                            self.name(),
                            policy.retry_delay,
                            error
                        );
                        self.notify_error(&error);
                    }
                    self.transition(PieceState::WaitingForRetry);
                    thread::sleep(policy.retry_delay);
                }
                RetryDecision::GiveUp => {
                    error!(
                        "[{}] 连续 {} 次协议错误（另有 {} 次网络错误），放弃下载: {}",
                        self.name(),
                        retry.fatal_errors,
                        retry.transient_errors,
                        error
                    );
                    self.notify_fatal(&error);
                    self.transition(PieceState::FatalError);
                    return PieceState::FatalError;
                }
                RetryDecision::Park => {
                    error!("[{}] 未知错误，等待恢复: {}", self.name(), error);
                    self.notify_fatal(&error);
                    self.park_in_error();
                }
            }
        }
    }

    fn park_in_error(&self) {
        {
            let mut st = self.lock_status();
            st.state = PieceState::Error;
            st.speed = 0;
            st.error_parked = true;
        }
        self.notify_state(PieceState::Error);
        let mut st = self.lock_status();
        while st.error_parked {
            st = self.wait(st);
        }
    }

    /// 暂停点：有暂停请求时通知 Paused 并等待恢复，返回是否暂停过
    fn pause_point(&self) -> bool {
        {
            let mut st = self.lock_status();
            if !st.pause_requested {
                return false;
            }
            st.state = PieceState::Paused;
            st.speed = 0;
            st.pause_parked = true;
        }
        info!("[{}] 已暂停", self.name());
        self.notify_state(PieceState::Paused);

        let mut st = self.lock_status();
        while st.pause_requested {
            st = self.wait(st);
        }
        st.pause_parked = false;
        st.state_before_pause = None;
        st.force_resume = true;
        drop(st);
        info!("[{}] 已恢复", self.name());
        true
    }

    fn attempt(&self) -> LeechResult<PieceState> {
        self.pause_point();
        let ctx = &self.inner.context;
        let local = ctx.local_file();
        prepare_folder(&local)?;

        let already = self.prepare_local_file(&local)?;
        self.set_downloaded(already);
        if already == ctx.piece_length {
            if !local.exists() {
                File::create(&local)?;
            }
            info!("[{}] 本地文件已完整，跳过下载", self.name());
            return Ok(self.complete());
        }

        self.transition(PieceState::Connecting);
        let mut session = Session::open(self.inner.connector.as_ref(), ctx)?;
        self.transition(PieceState::Connected);

        let offset = ctx.remote_offset(already);
        debug!(
            "[{}] 从偏移 {} 读取 {}，已有 {} 字节",
            self.name(),
            offset,
            ctx.remote_path,
            already
        );
        let mut input = session.open_read_stream(&ctx.remote_path, offset)?;
        let mut output = OpenOptions::new().create(true).append(true).open(&local)?;

        self.transition(PieceState::Downloading);
        self.stream_piece(&mut input, &mut output, already)?;
        output.flush()?;
        drop(output);
        drop(input);
        drop(session);
        Ok(self.complete())
    }

    /// 不续传时删除旧文件；续传时返回已有长度
    fn prepare_local_file(&self, local: &Path) -> LeechResult<u64> {
        let ctx = &self.inner.context;
        let force_resume = mem::take(&mut self.lock_status().force_resume);
        if ctx.resume || force_resume {
            let existing = match fs::metadata(local) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            if existing > ctx.piece_length {
                return Err(LeechError::ResumeOffset {
                    path: local.to_path_buf(),
                    actual: existing,
                    expected: ctx.piece_length,
                });
            }
            Ok(existing)
        } else {
            if local.exists() {
                fs::remove_file(local).map_err(|_| LeechError::DeleteFile(local.to_path_buf()))?;
            }
            Ok(0)
        }
    }

    fn stream_piece(&self, input: &mut ByteStream, output: &mut File, mut downloaded: u64) -> LeechResult<()> {
        let ctx = &self.inner.context;
        let interval = self.inner.policy.progress_interval;
        let mut buffer = vec![0u8; ctx.buffer_size.max(1)];
        let mut interval_bytes = 0u64;
        let mut interval_start = Instant::now();

        while downloaded < ctx.piece_length {
            if self.pause_point() {
                self.transition(PieceState::Downloading);
                interval_bytes = 0;
                interval_start = Instant::now();
            }

            let read = match input.read(&mut buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("数据流提前结束: {}/{} 字节", downloaded, ctx.piece_length),
                    )
                    .into())
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            // 远程流会一直读到文件尾，不能写过分片边界
            let take = (read as u64).min(ctx.piece_length - downloaded) as usize;
            output.write_all(&buffer[..take])?;
            downloaded += take as u64;
            interval_bytes += take as u64;
            self.set_downloaded(downloaded);

            let elapsed = interval_start.elapsed();
            if elapsed >= interval {
                let millis = (elapsed.as_millis() as u64).max(1);
                let rate = interval_bytes * 1000 / millis;
                {
                    // 已请求暂停时保持速度为零
                    let mut st = self.lock_status();
                    if st.state == PieceState::Downloading {
                        st.speed = rate;
                    }
                }
                self.notify_progress(downloaded, rate);
                interval_bytes = 0;
                interval_start = Instant::now();
            }
        }
        Ok(())
    }

    fn complete(&self) -> PieceState {
        let state = if self.inner.context.is_multipart() {
            PieceState::Downloaded
        } else {
            PieceState::Finished
        };
        {
            let mut st = self.lock_status();
            st.speed = 0;
            st.force_resume = false;
        }
        info!("[{}] 下载完成，{} 字节", self.name(), self.length());
        self.transition(state);
        state
    }
}

fn prepare_folder(local: &Path) -> LeechResult<()> {
    match local.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => fs::create_dir_all(parent)
            .map_err(|_| LeechError::CreateFolder(parent.to_path_buf())),
        _ => Ok(()),
    }
}

impl PartialEq for PieceWorker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for PieceWorker {}

impl fmt::Debug for PieceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock_status();
        f.debug_struct("PieceWorker")
            .field("name", &self.inner.context.display_name())
            .field("state", &st.state)
            .field("downloaded", &st.downloaded)
            .field("length", &self.inner.context.piece_length)
            .finish()
    }
}
