use anyhow::Context;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::{cursor, execute, terminal};
use log::{error, info};
use std::fs;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ftpleech::cli;
use ftpleech::config::Config;
use ftpleech::core::task::Merger;
use ftpleech::core::{DownloadTask, GroupIdSequence, Scheduler, TaskBuilder};
use ftpleech::transport::Source;
use ftpleech::ui::{self, DownloadSummary, ProgressManager};
use ftpleech::utils::logger;

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(200);
const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 终端原始模式，离开作用域时恢复
struct RawMode;

impl RawMode {
    fn enable() -> Option<Self> {
        terminal::enable_raw_mode().ok()?;
        let _ = execute!(std::io::stdout(), cursor::Hide);
        Some(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = execute!(std::io::stdout(), cursor::Show);
        let _ = terminal::disable_raw_mode();
    }
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    if args.edit_config {
        // 确保配置文件存在后再打开
        Config::load(&args.config)?;
        cli::open_config_in_editor(&args.config);
        return Ok(());
    }

    let config = args.load_config()?;
    logger::init(&config)?;
    info!(
        "ftpleech {} (构建于 {}) 启动，配置文件 {}",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_BUILD_DATE"),
        args.config
    );

    let sources = args.get_sources()?;
    println!("{}", config.get_summary());
    info!("{}", config.get_summary());

    let tasks = create_tasks(&config, &sources);
    if tasks.is_empty() {
        eprintln!("没有可下载的任务");
        return Ok(());
    }

    let scheduler = Scheduler::new(config.working_threads)?;
    // 输出被重定向时不绘制进度条
    let progress = Arc::new(if std::io::stdout().is_terminal() {
        ProgressManager::new()
    } else {
        ProgressManager::hidden()
    });
    scheduler.set_notification_adapter(Some(progress.clone()));
    scheduler.enqueue(&tasks);

    println!("\n开始下载... (p 暂停, r 恢复, +/- 调整并发数, q 退出)");
    info!("开始下载 {} 个文件，{} 个分片", tasks.len(), scheduler.size());

    let started = Instant::now();
    let quit = run_download_loop(&scheduler, &tasks, &progress)?;
    progress.finish();
    scheduler.set_notification_adapter(None);

    if quit {
        let paused = scheduler.pause_all();
        info!("用户退出，暂停了 {} 个分片", paused);
    }
    scheduler.shutdown()?;

    let session = config.download_path().join(".ftpleech").join("session.json");
    if let Err(e) = save_session(&scheduler, &session) {
        error!("保存会话失败: {:#}", e);
    }

    let summary = DownloadSummary::from_tasks(&tasks, started.elapsed());
    info!("下载结束 - 成功: {}, 失败: {}", summary.success_count, summary.failed_count);
    println!("{}", summary);
    Ok(())
}

/// 为每个下载源生成任务，失败的源只打印错误
fn create_tasks(config: &Config, sources: &[String]) -> Vec<DownloadTask> {
    let merger = Arc::new(Merger::new(config.merge_options()));
    let group_ids = Arc::new(GroupIdSequence::new());
    let download_dir = config.download_path();
    let mut tasks = Vec::new();

    for source in sources {
        let created = Source::parse(source, &config.connection_params()).and_then(|parsed| {
            let builder = TaskBuilder::new(
                config.task_settings(parsed.params.clone()),
                parsed.connector()?,
                merger.clone(),
            )
            .with_group_ids(group_ids.clone());
            builder.create_tasks(&parsed.remote_path, &download_dir)
        });
        match created {
            Ok(created) => {
                ui::print_success(&format!("{}: {} 个文件", source, created.len()));
                info!("创建下载任务: {} ({} 个文件)", source, created.len());
                tasks.extend(created);
            }
            Err(e) => {
                ui::print_error(&format!("{}: {}", source, e));
                error!("创建下载任务失败: {} - {}", source, e);
            }
        }
    }
    tasks
}

/// 运行下载主循环，返回用户是否主动退出
fn run_download_loop(
    scheduler: &Scheduler,
    tasks: &[DownloadTask],
    progress: &ProgressManager,
) -> anyhow::Result<bool> {
    let raw_mode = RawMode::enable();
    let mut paused = false;
    let mut last_update: Option<Instant> = None;

    loop {
        if raw_mode.is_some() && event::poll(KEYBOARD_POLL_INTERVAL)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') => {
                        info!("用户主动退出下载");
                        return Ok(true);
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        info!("用户中断下载");
                        return Ok(true);
                    }
                    KeyCode::Char('p') | KeyCode::Char('P') => {
                        let count = scheduler.pause_all();
                        paused = true;
                        progress.println(format!("已暂停 {} 个分片", count));
                        info!("用户暂停所有下载任务");
                    }
                    KeyCode::Char('r') | KeyCode::Char('R') => {
                        scheduler.resume_all();
                        paused = false;
                        progress.println("已恢复所有下载任务");
                        info!("用户恢复所有下载任务");
                    }
                    KeyCode::Char('+') | KeyCode::Char('=') => {
                        scheduler.set_working_threads(scheduler.working_threads() + 1);
                    }
                    KeyCode::Char('-') => {
                        let threads = scheduler.working_threads();
                        if threads > 1 {
                            scheduler.set_working_threads(threads - 1);
                        }
                    }
                    _ => {}
                }
            }
        } else if raw_mode.is_none() {
            std::thread::sleep(KEYBOARD_POLL_INTERVAL);
        }

        if last_update.map_or(true, |t| t.elapsed() >= PROGRESS_UPDATE_INTERVAL) {
            progress.update(&scheduler.statistics(), scheduler.working_threads(), paused);
            if tasks.iter().all(|t| t.is_settled()) {
                return Ok(false);
            }
            last_update = Some(Instant::now());
        }
    }
}

/// 保存所有分片的快照
fn save_session(scheduler: &Scheduler, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("无法创建目录 {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&scheduler.snapshot())?;
    fs::write(path, json).with_context(|| format!("无法写入 {}", path.display()))?;
    info!("会话已保存到 {}", path.display());
    Ok(())
}
