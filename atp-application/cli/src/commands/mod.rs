//! CLI 命令处理模块

pub mod action;
pub mod output; // 公共输出格式
pub mod run;
pub mod snapshot;
pub mod testcase;

use std::path::Path;

use anyhow::{Context, Result};
use atp_executor::RunConfig;

/// 加载运行配置：指定文件或默认搜索路径，再应用环境变量
pub fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    RunConfig::load_with(path).context("加载配置失败")
}
