use log::{error, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use super::listener::DownloadListener;
use super::merger::Merger;
use super::state::PieceState;
use super::worker::PieceWorker;
use crate::core::error::{LeechError, LeechResult};

#[derive(Debug, Default)]
struct GroupProgress {
    /// 尚未完成的分片序号
    working: BTreeSet<usize>,
    merge_scheduled: bool,
    /// 合并结果，None 表示还没合并
    merged: Option<bool>,
}

/// 同一远程文件的所有分片
///
/// 监听每个分片，全部下载完成后在独立线程上合并一次，之后注销自己。
pub struct PieceGroup {
    id: u64,
    members: Vec<PieceWorker>,
    merger: Arc<Merger>,
    me: Weak<PieceGroup>,
    progress: Mutex<GroupProgress>,
    done: Condvar,
}

impl PieceGroup {
    pub fn new(members: Vec<PieceWorker>, merger: Arc<Merger>) -> LeechResult<Arc<Self>> {
        if members.len() < 2 {
            return Err(LeechError::invalid_state("分组至少需要两个分片"));
        }
        let id = members[0].piece_context().group_id;
        if let Some(stranger) = members.iter().find(|m| m.piece_context().group_id != id) {
            return Err(LeechError::invalid_state(format!(
                "分片 {} 不属于分组 {}",
                stranger.name(),
                id
            )));
        }
        // 先检查全部成员，避免部分分片被绑定到未建成的分组
        if let Some(taken) = members.iter().find(|m| m.group().is_some_and(|g| g != id)) {
            return Err(LeechError::invalid_state(format!(
                "分片 {} 已属于其它分组",
                taken.name()
            )));
        }
        for member in &members {
            member.attach_group(id)?;
        }

        let working = members.iter().map(|m| m.piece_context().part).collect();
        let group = Arc::new_cyclic(|me| PieceGroup {
            id,
            members,
            merger,
            me: me.clone(),
            progress: Mutex::new(GroupProgress {
                working,
                ..Default::default()
            }),
            done: Condvar::new(),
        });
        for member in &group.members {
            member.register_listener(group.clone());
        }
        Ok(group)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[PieceWorker] {
        &self.members
    }

    fn lock(&self) -> MutexGuard<'_, GroupProgress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 合并结果，还没合并时为 None
    pub fn merged(&self) -> Option<bool> {
        self.lock().merged
    }

    /// 等待合并结束，超时返回 None
    pub fn wait_merged(&self, timeout: Duration) -> Option<bool> {
        let progress = self.lock();
        let (progress, _) = self
            .done
            .wait_timeout_while(progress, timeout, |p| p.merged.is_none())
            .unwrap_or_else(|e| e.into_inner());
        progress.merged
    }

    fn schedule_merge(&self) {
        let Some(group) = self.me.upgrade() else {
            return;
        };
        let delay = self.merger.options().unwind_delay;
        let spawned = thread::Builder::new()
            .name(format!("merge-{}", self.id))
            .spawn(move || {
                thread::sleep(delay);
                let result = group.merger.merge(&group.members);
                group.finish(result.is_ok());
            });
        if let Err(e) = spawned {
            error!("分组 {} 无法创建合并线程: {}", self.id, e);
            if let Some(group) = self.me.upgrade() {
                group.finish(false);
            }
        }
    }

    fn finish(self: &Arc<Self>, success: bool) {
        let me: Arc<dyn DownloadListener> = self.clone();
        for member in &self.members {
            member.unregister_listener(&me);
        }
        self.lock().merged = Some(success);
        self.done.notify_all();
    }
}

impl DownloadListener for PieceGroup {
    fn on_state_change(&self, source: &PieceWorker, state: PieceState) {
        if !state.is_success() {
            return;
        }
        let mut progress = self.lock();
        if progress.merge_scheduled {
            return;
        }
        let part = source.piece_context().part;
        if !progress.working.remove(&part) {
            warn!("分组 {}: 分片 {} 重复报告完成", self.id, source.name());
            return;
        }
        if progress.working.is_empty() {
            progress.merge_scheduled = true;
            drop(progress);
            info!("分组 {} 的 {} 个分片全部下载完成", self.id, self.members.len());
            self.schedule_merge();
        }
    }
}
