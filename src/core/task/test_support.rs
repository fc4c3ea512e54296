//! 单元测试共用的观察者和重试策略

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::listener::DownloadListener;
use super::retry::RetryPolicy;
use super::state::PieceState;
use super::worker::PieceWorker;
use crate::core::error::LeechError;

/// 毫秒级的重试等待
pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        fatal_error_limit: 5,
        retry_delay: Duration::from_millis(2),
        progress_interval: Duration::from_millis(1000),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    State(PieceState),
    Error,
    /// 携带协议返回码
    Fatal(Option<u32>),
    Progress(u64, u64),
}

/// 记录收到的所有事件
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn states(&self) -> Vec<PieceState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::State(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub(crate) fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[Event]) -> bool) -> bool {
        let events = self.events.lock().unwrap();
        let (events, _) = self
            .changed
            .wait_timeout_while(events, timeout, |events| !predicate(events))
            .unwrap();
        predicate(&events)
    }
}

impl DownloadListener for Recorder {
    fn on_error(&self, _source: &PieceWorker, _error: &LeechError) {
        self.push(Event::Error);
    }

    fn on_fatal_error(&self, _source: &PieceWorker, error: &LeechError) {
        self.push(Event::Fatal(error.reply_code()));
    }

    fn on_progress(&self, _source: &PieceWorker, downloaded: u64, rate: u64) {
        self.push(Event::Progress(downloaded, rate));
    }

    fn on_state_change(&self, _source: &PieceWorker, state: PieceState) {
        self.push(Event::State(state));
    }
}

/// 轮询等待条件成立
pub(crate) fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
