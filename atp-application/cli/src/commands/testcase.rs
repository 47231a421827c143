//! Testcase 命令处理

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;

use atp_executor::{Step, TestCase, TestCaseLoader, TestCaseSource};

use super::load_config;
use crate::TestcaseAction;

pub fn handle(action: TestcaseAction, config_path: Option<&Path>) -> Result<()> {
    match action {
        TestcaseAction::List { testcase_dir } => {
            list_testcases(&resolve_dir(testcase_dir, config_path)?)
        }
        TestcaseAction::Show { name, testcase_dir } => {
            show_testcase(&resolve_dir(testcase_dir, config_path)?, &name)
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>, config_path: Option<&Path>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(load_config(config_path)?.testcase_dir),
    }
}

fn list_testcases(dir: &Path) -> Result<()> {
    if !dir.exists() {
        println!("{}", format!("测试用例目录不存在: {:?}", dir).yellow());
        println!("\n可以通过 --testcase-dir 或配置文件中的 testcase_dir 指定测试用例目录");
        return Ok(());
    }

    let loader = TestCaseLoader::new(dir);
    let names = loader
        .list()
        .with_context(|| format!("读取测试用例目录失败: {:?}", dir))?;

    if names.is_empty() {
        println!("{} 没有找到测试用例", "ℹ".yellow());
        return Ok(());
    }

    println!("{}\n", format!("测试用例目录: {:?}", dir).bold());
    println!(
        "{:<30} {:<30} {:<6} {:<6} {:<6}",
        "名称".bold(),
        "依赖".bold(),
        "准备".bold(),
        "交互".bold(),
        "清理".bold()
    );
    println!("{}", "-".repeat(84));

    for name in names {
        match loader.load(&name) {
            Ok(testcase) => println!(
                "{:<30} {:<30} {:<6} {:<6} {:<6}",
                testcase.name.cyan(),
                dependencies(&testcase),
                testcase.setup.len(),
                testcase.interaction.len(),
                testcase.cleanup.len()
            ),
            Err(e) => println!("{:<30} {}", name.red(), e),
        }
    }

    Ok(())
}

fn dependencies(testcase: &TestCase) -> String {
    if testcase.depends_on.is_empty() {
        "-".to_string()
    } else {
        testcase.depends_on.join(", ")
    }
}

fn print_steps(title: &str, steps: &[Step]) {
    println!("\n  {} ({})", title.bold(), steps.len());
    for (index, step) in steps.iter().enumerate() {
        let marker = if step.physical {
            " [人工]".yellow().to_string()
        } else {
            String::new()
        };
        println!("    {}. {}{}", index + 1, step.text, marker);
    }
}

fn show_testcase(dir: &Path, name: &str) -> Result<()> {
    let testcase = TestCaseLoader::new(dir)
        .load(name)
        .with_context(|| format!("加载测试用例失败: {}", name))?;

    println!("\n{} {}\n", "测试用例:".bold(), testcase.name.cyan().bold());
    println!("  依赖: {}", dependencies(&testcase));
    println!(
        "  等待: 最长 {} 分钟, 每 {} 分钟检查一次",
        testcase.timing.max_wait_minutes, testcase.timing.poll_interval_minutes
    );

    print_steps("准备 (@pre)", &testcase.setup);
    print_steps("交互 (@run)", &testcase.interaction);
    print_steps("清理 (@finally)", &testcase.cleanup);
    println!();

    Ok(())
}
