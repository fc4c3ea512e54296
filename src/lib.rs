//! ftpleech: 分片并发文件下载器
//!
//! 远程文件按固定大小切成分片，每个分片由独立线程下载，失败按错误类别重试，
//! 同一文件的分片全部下载完成后按顺序合并为目标文件。调度器限制同时运行的分片数。

pub mod cli;
pub mod config;
pub mod core;
pub mod transport;
pub mod ui;
pub mod utils;
