//! Snapshot 命令处理

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;

use atp_executor::{InteractionRecipe, RecipeTarget, SnapshotStore};

use super::load_config;
use super::output::print_serialized;
use crate::SnapshotAction;

pub fn handle(action: SnapshotAction, config_path: Option<&Path>) -> Result<()> {
    match action {
        SnapshotAction::List { snapshot_path } => {
            list_snapshots(&open_store(snapshot_path, config_path)?)
        }
        SnapshotAction::Show {
            step,
            snapshot_path,
        } => show_snapshot(&open_store(snapshot_path, config_path)?, &step),
        SnapshotAction::Remove {
            step,
            snapshot_path,
        } => remove_snapshot(&mut open_store(snapshot_path, config_path)?, &step),
    }
}

fn open_store(path: Option<PathBuf>, config_path: Option<&Path>) -> Result<SnapshotStore> {
    let path = match path {
        Some(path) => path,
        None => load_config(config_path)?.snapshot_path,
    };
    SnapshotStore::open(&path).with_context(|| format!("打开快照缓存失败: {:?}", path))
}

fn describe_target(recipe: &InteractionRecipe) -> String {
    match &recipe.target {
        RecipeTarget::Selector { selector } => selector.clone(),
        RecipeTarget::Coordinates { x, y } => format!("({}, {})", x, y),
        RecipeTarget::Keyboard => match recipe.arguments.first() {
            Some(key) => format!("key {}", key),
            None => "keyboard".to_string(),
        },
    }
}

fn list_snapshots(store: &SnapshotStore) -> Result<()> {
    if store.is_empty() {
        println!("{} 快照缓存为空: {:?}", "ℹ".yellow(), store.path());
        return Ok(());
    }

    println!(
        "\n{} {} 条配方 ({:?}):\n",
        "✓".green(),
        store.len(),
        store.path()
    );
    println!(
        "{:<40} {:<10} {:<30}",
        "步骤".bold(),
        "方法".bold(),
        "目标".bold()
    );
    println!("{}", "-".repeat(82));

    for (step, recipe) in store.iter() {
        let short: String = step.chars().take(38).collect();
        println!(
            "{:<40} {:<10} {:<30}",
            short,
            recipe.method.cyan(),
            describe_target(recipe)
        );
    }

    Ok(())
}

fn show_snapshot(store: &SnapshotStore, step: &str) -> Result<()> {
    match store.get(step) {
        Some(recipe) => print_serialized(recipe, "json"),
        None => {
            println!("{} 没有缓存的配方: {}", "✗".red(), step);
            Ok(())
        }
    }
}

fn remove_snapshot(store: &mut SnapshotStore, step: &str) -> Result<()> {
    match store.remove(step)? {
        Some(_) => println!("{} 已删除配方: {}", "✓".green(), step),
        None => println!("{} 没有缓存的配方: {}", "ℹ".yellow(), step),
    }
    Ok(())
}
