//! Quota inspection and plan changes

use super::AppContext;
use crate::cli::QuotaCommand;
use crate::config::Config;
use crate::error::Result;
use colored::Colorize;
use prettytable::{format, Table};

/// Handle quota commands
pub async fn handle_quota(config: Config, command: QuotaCommand) -> Result<()> {
    let ctx = AppContext::build(config).await?;

    match command {
        QuotaCommand::Status => {
            let usage = ctx.quota.usage(&ctx.owner_id).await?;
            let decision = ctx.quota.check_quota(&ctx.owner_id).await?;
            let limit = ctx.config.quota.limit_for(decision.plan);

            let daily_limit = limit
                .daily_limit
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unlimited".to_string());
            let daily_remaining = decision
                .remaining_daily
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
            table.add_row(prettytable::row![
                "Period".bold(),
                "Used".bold(),
                "Limit".bold(),
                "Remaining".bold()
            ]);
            table.add_row(prettytable::row![
                "Today",
                usage.current_day_usage,
                daily_limit,
                daily_remaining
            ]);
            table.add_row(prettytable::row![
                "This month",
                usage.current_month_usage,
                limit.monthly_limit,
                decision.remaining_monthly
            ]);

            println!("\nOwner: {}", ctx.owner_id.cyan());
            println!("Plan:  {}", decision.plan.to_string().bold());
            table.printstd();

            match decision.reason {
                Some(reason) => println!("{}\n", reason.notice().yellow()),
                None => println!("{}\n", "You can send messages.".green()),
            }
        }
        QuotaCommand::SetPlan { plan } => {
            ctx.quota.set_plan(&ctx.owner_id, plan).await?;
            println!(
                "{}",
                format!("Plan for {} set to {}", ctx.owner_id, plan).green()
            );
        }
    }

    Ok(())
}
