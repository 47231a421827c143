//! 交互快照缓存
//!
//! 以步骤文本为键保存可直接回放的操作配方，整个缓存是一个 JSON 文件。
//! 打开时加载一次，每次写入后整体重写文件。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{ExecutorError, Result};

/// 操作目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecipeTarget {
    /// 元素选择器
    Selector { selector: String },
    /// 屏幕坐标（恢复代理给出的点击位置）
    Coordinates { x: i64, y: i64 },
    /// 键盘操作，不需要目标元素
    Keyboard,
}

/// 可回放的操作配方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecipe {
    /// 步骤文本
    pub step: String,

    /// 操作方法（click、fill、press ...）
    pub method: String,

    pub target: RecipeTarget,

    /// 操作参数
    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub description: String,
}

impl InteractionRecipe {
    pub fn selector(
        step: impl Into<String>,
        method: impl Into<String>,
        selector: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            method: method.into(),
            target: RecipeTarget::Selector {
                selector: selector.into(),
            },
            arguments: Vec::new(),
            description: String::new(),
        }
    }

    /// 恢复代理给出的坐标点击
    pub fn click_at(step: impl Into<String>, x: i64, y: i64) -> Self {
        Self {
            step: step.into(),
            method: "click".to_string(),
            target: RecipeTarget::Coordinates { x, y },
            arguments: Vec::new(),
            description: "Recovered by agent_act".to_string(),
        }
    }

    /// 按键
    pub fn press(step: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            method: "press".to_string(),
            target: RecipeTarget::Keyboard,
            arguments: vec![key.into()],
            description: String::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 快照缓存
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    entries: BTreeMap<String, InteractionRecipe>,
}

impl SnapshotStore {
    /// 打开缓存文件，不存在时创建空缓存
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                match serde_json::from_str(&content) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!("快照缓存文件损坏, 使用空缓存: {:?} ({})", path, e);
                        BTreeMap::new()
                    }
                }
            }
        } else {
            BTreeMap::new()
        };

        info!("已加载快照缓存: {:?} ({} 条)", path, entries.len());
        Ok(Self { path, entries })
    }

    pub fn get(&self, step: &str) -> Option<&InteractionRecipe> {
        self.entries.get(step)
    }

    /// 写入配方（同一步骤直接覆盖）并持久化
    pub fn put(&mut self, step: &str, recipe: InteractionRecipe) -> Result<()> {
        debug!("写入快照: {} -> {}", step, recipe.method);
        self.entries.insert(step.to_string(), recipe);
        self.persist()
    }

    /// 删除配方
    pub fn remove(&mut self, step: &str) -> Result<Option<InteractionRecipe>> {
        let removed = self.entries.remove(step);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| ExecutorError::SerdeError(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InteractionRecipe)> {
        self.entries.iter()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
