//! Action 命令处理

use anyhow::Result;
use colored::Colorize;

use atp_executor::{parse_action_command, Action, PlannedStep};

use super::output::print_serialized;
use crate::ActionAction;

pub fn handle(action: ActionAction) -> Result<()> {
    match action {
        ActionAction::Parse { command, format } => parse(&command, &format),
    }
}

fn parse(command: &str, format: &str) -> Result<()> {
    let action = match parse_action_command(command)? {
        PlannedStep::Done => {
            println!("{} done (动作列表结束标记)", "✓".green());
            return Ok(());
        }
        PlannedStep::Action(action) => action,
    };

    match format {
        "json" | "yaml" => print_serialized(&action, format),
        _ => {
            print_action(&action);
            Ok(())
        }
    }
}

fn print_action(action: &Action) {
    println!("{} {}", "✓".green(), action.describe().cyan());
    println!("  名称: {}", action.name());
    println!("  类别: {:?}", action.kind());
    println!("  通道: {}", action.transport());
    if let Some(command) = action.command() {
        println!("  命令: {}", command);
    }
    if action.is_verification() {
        println!("  {}", "校验动作, 失败时不进入修复".yellow());
    }
}
