use chrono::Local;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::state::PieceState;
use super::worker::PieceWorker;
use crate::core::error::{LeechError, LeechResult};

/// 合并选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// 最后一个分片完成后，等待其下载线程收尾的时间
    pub unwind_delay: Duration,
    /// 合并成功后保留分片文件
    pub keep_parts: bool,
    /// 等待下载线程退出的最长时间
    pub exit_timeout: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            unwind_delay: Duration::from_millis(500),
            keep_parts: false,
            exit_timeout: Duration::from_secs(30),
        }
    }
}

/// 把同一分组的分片文件按序号拼接成最终文件
#[derive(Debug, Default)]
pub struct Merger {
    options: MergeOptions,
}

impl Merger {
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// 按分组合并，只有一个分片的文件没有合并步骤
    ///
    /// 某个分组失败不影响其它分组，返回遇到的第一个错误。
    pub fn merge(&self, pieces: &[PieceWorker]) -> LeechResult<()> {
        let mut groups: BTreeMap<u64, Vec<&PieceWorker>> = BTreeMap::new();
        for piece in pieces {
            groups.entry(piece.piece_context().group_id).or_default().push(piece);
        }

        let mut first_error = None;
        for (group_id, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by_key(|piece| piece.piece_context().part);
            if let Err(e) = self.merge_group(group_id, &members) {
                error!("分组 {} 合并失败: {}", group_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn merge_group(&self, group_id: u64, members: &[&PieceWorker]) -> LeechResult<()> {
        for piece in members {
            if !piece.wait_detached(self.options.exit_timeout) {
                return Err(LeechError::Merge(format!(
                    "分片 {} 的下载线程仍未退出",
                    piece.name()
                )));
            }
        }

        let output = members[0].piece_context().output_file();
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|_| LeechError::CreateFolder(parent.to_path_buf()))?;
        }
        let staging = staging_path(&output);
        info!("开始合并 {} 个分片到 {}", members.len(), output.display());

        // 全部分片写入临时文件后才改为最终文件名
        let written = write_staging(group_id, members, &staging).and_then(|_| {
            set_aside(&output)?;
            fs::rename(&staging, &output)?;
            Ok(())
        });
        if let Err(e) = written {
            discard_staging(&staging);
            // 已复制的分片文件仍完整
            for piece in members {
                if piece.state() == PieceState::Merging {
                    piece.transition(PieceState::Downloaded);
                }
            }
            return Err(e);
        }
        for piece in members {
            piece.transition(PieceState::Finished);
        }
        info!("合并完成: {}", output.display());

        if !self.options.keep_parts {
            for piece in members {
                let part = piece.piece_context().local_file();
                if let Err(e) = fs::remove_file(&part) {
                    warn!("删除分片文件失败 {}: {}", part.display(), e);
                }
            }
        }
        Ok(())
    }
}

fn write_staging(group_id: u64, members: &[&PieceWorker], staging: &Path) -> LeechResult<()> {
    let mut writer = BufWriter::new(File::create(staging)?);
    for piece in members {
        piece.transition(PieceState::Merging);
        if let Err(e) = append_piece(piece, &mut writer) {
            let message = e.to_string();
            error!("[{}] 合并失败: {}", piece.name(), message);
            piece.fail(e);
            return Err(LeechError::Merge(format!(
                "分组 {} 在分片 {} 处中止: {}",
                group_id,
                piece.piece_context().part,
                message
            )));
        }
    }
    writer.flush()?;
    Ok(())
}

fn discard_staging(staging: &Path) {
    if let Err(e) = fs::remove_file(staging) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("删除临时文件失败 {}: {}", staging.display(), e);
        }
    }
}

/// 合并过程中使用的临时文件
fn staging_path(output: &Path) -> PathBuf {
    let mut staging = output.as_os_str().to_owned();
    staging.push(".merging");
    PathBuf::from(staging)
}

/// 复制分片的前 `length` 字节，少于预期时报错
fn append_piece(piece: &PieceWorker, writer: &mut impl Write) -> LeechResult<()> {
    let path = piece.piece_context().local_file();
    let expected = piece.length();
    let file = File::open(&path)?;
    let on_disk = file.metadata()?.len();
    if on_disk > expected {
        warn!(
            "分片文件比预期长: {}，预期 {} 字节，实际 {} 字节",
            path.display(),
            expected,
            on_disk
        );
    }
    let copied = io::copy(&mut file.take(expected), writer)?;
    if copied < expected {
        return Err(LeechError::MergeMismatch {
            path,
            expected,
            actual: copied,
        });
    }
    Ok(())
}

/// 已存在的输出文件加上时间戳后缀改名
fn set_aside(output: &Path) -> LeechResult<()> {
    if !output.exists() {
        return Ok(());
    }
    let mut renamed = output.as_os_str().to_owned();
    renamed.push(format!(".{}", Local::now().format("%Y%m%d-%H%M%S%.3f")));
    let renamed = PathBuf::from(renamed);
    warn!(
        "输出文件已存在，重命名为 {}",
        renamed.display()
    );
    fs::rename(output, &renamed)?;
    Ok(())
}
