//! CLI 通用输出格式化模块

use anyhow::Result;
use chrono::Local;
use colored::{ColoredString, Colorize};
use serde::Serialize;

use atp_executor::{PhaseReport, RunSummary, StepStatus, TestCaseReport, TestStatus};

/// 按格式输出单个可序列化对象 (json/yaml)
pub fn print_serialized<T: Serialize>(value: &T, format: &str) -> Result<()> {
    match format {
        "yaml" => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

pub fn status_label(status: TestStatus) -> ColoredString {
    match status {
        TestStatus::Passed => "PASSED".green().bold(),
        TestStatus::Failed => "FAILED".red().bold(),
        TestStatus::Skipped => "SKIPPED".yellow().bold(),
    }
}

pub fn format_duration(ms: u64) -> String {
    format!("{:.2}s", ms as f64 / 1000.0)
}

fn print_phase(phase: &PhaseReport) {
    let icon = if phase.passed { "✓".green() } else { "✗".red() };
    println!(
        "  {} {} ({} 步, {})",
        icon.bold(),
        phase.phase.to_string().bold(),
        phase.steps.len(),
        format_duration(phase.duration_ms).bright_black()
    );

    for step in &phase.steps {
        let status_icon = match step.status {
            StepStatus::Success => "✓".green(),
            StepStatus::Failed => "✗".red(),
            StepStatus::Skipped => "⊘".yellow(),
        };
        let healed = if step.healing_attempts > 0 {
            format!(" [修复 {} 次]", step.healing_attempts)
        } else {
            String::new()
        };
        println!(
            "     {} {}: {}{}",
            status_icon,
            (step.index + 1).to_string().bright_black(),
            step.description,
            healed.cyan()
        );
        if let Some(error) = &step.error {
            println!("        错误: {}", error.red());
        }
    }

    if let Some(reason) = &phase.reason {
        println!("     原因: {}", reason.yellow());
    }
}

fn print_testcase(report: &TestCaseReport) {
    println!(
        "{} {} ({})",
        status_label(report.status),
        report.name.cyan().bold(),
        format_duration(report.duration_ms).bright_black()
    );
    if let Some(reason) = &report.reason {
        println!("  原因: {}", reason.yellow());
    }
    for phase in &report.phases {
        print_phase(phase);
    }
    println!();
}

/// 打印运行汇总
pub fn print_summary(summary: &RunSummary) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "执行报告".bold());
    println!("{}", "=".repeat(60));
    println!("运行 ID:  {}", summary.run_id.to_string().bright_black());
    println!(
        "开始时间: {}",
        summary
            .started_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    println!();

    for report in &summary.reports {
        print_testcase(report);
    }

    println!("{}", "-".repeat(60));
    println!(
        "通过: {}  失败: {}  跳过: {}",
        summary.passed_count().to_string().green(),
        summary.failed_count().to_string().red(),
        summary.skipped_count().to_string().yellow()
    );
    println!(
        "{}: {}",
        summary.target.cyan().bold(),
        status_label(summary.status)
    );
    println!("{}", "=".repeat(60));
}
