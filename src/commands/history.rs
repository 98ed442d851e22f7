use super::chat::{print_transcript, resolve_message_id, short_id};
use super::AppContext;
use crate::chat::{group_sessions, TitleGenerator};
use crate::cli::HistoryCommand;
use crate::config::Config;
use crate::error::{ChatflowError, Result};
use crate::providers::create_provider;
use crate::storage::Session;
use chrono::Local;
use colored::Colorize;
use prettytable::{format, Table};

const TITLE_COLUMN_CHARS: usize = 40;

/// Handle history commands
pub async fn handle_history(config: Config, command: HistoryCommand) -> Result<()> {
    let ctx = AppContext::build(config).await?;

    match command {
        HistoryCommand::List => {
            let sessions = ctx.store.sessions().await;

            if sessions.is_empty() {
                println!("{}", "No chat sessions found.".yellow());
                return Ok(());
            }

            let now = Local::now();
            for group in group_sessions(&sessions, &now, ctx.config.grouping.week_start) {
                println!("\n{}", group.bucket.label().bold());
                print_session_table(&group.sessions);
            }
            println!();
            println!(
                "Use {} to resume a session.",
                "chatflow chat --resume <ID>".cyan()
            );
            println!();
        }
        HistoryCommand::Show { id } => {
            let session = find(&ctx, &id).await?;
            print_transcript(&session);
        }
        HistoryCommand::Rename { id, title } => {
            let id = ctx.store.resolve_id(&id).await?;
            ctx.store.rename(&id, &title).await?;
            println!("{}", format!("Renamed session {}", short_id(&id)).green());
        }
        HistoryCommand::Delete { id } => {
            let id = ctx.store.resolve_id(&id).await?;
            ctx.store.delete(&id).await?;
            println!("{}", format!("Deleted session {}", short_id(&id)).green());
        }
        HistoryCommand::DeleteMany { ids } => {
            for prefix in &ids {
                let id = ctx.store.resolve_id(prefix).await?;
                ctx.store.toggle_selection(&id).await?;
            }
            let selected = ctx.store.selected().await;
            let deleted = ctx.store.delete_many(&selected).await?;
            println!("{}", format!("Deleted {} sessions", deleted.len()).green());
        }
        HistoryCommand::Pin { id } => {
            let id = ctx.store.resolve_id(&id).await?;
            let pinned = ctx.store.toggle_pin(&id).await?;
            let label = if pinned { "Pinned" } else { "Unpinned" };
            println!("{}", format!("{} session {}", label, short_id(&id)).green());
        }
        HistoryCommand::Duplicate { id } => {
            let id = ctx.store.resolve_id(&id).await?;
            let copy = ctx.store.duplicate(&id).await?;
            println!(
                "{}",
                format!("Duplicated {} as {}", short_id(&id), short_id(&copy)).green()
            );
        }
        HistoryCommand::Fork { id, at } => {
            let session = find(&ctx, &id).await?;
            let fork = match at {
                Some(prefix) => {
                    let message_id = resolve_message_id(&session, &prefix)?;
                    ctx.store.fork_at(&session.id, &message_id).await?
                }
                None => ctx.store.fork(&session.messages).await?,
            };
            println!(
                "{}",
                format!("Forked {} into {}", short_id(&session.id), short_id(&fork)).green()
            );
        }
        HistoryCommand::Retitle => {
            let provider = create_provider(&ctx.config.provider)?;
            let titles = TitleGenerator::new(provider, ctx.store.clone());
            let renamed = titles.backfill().await;
            println!("{}", format!("Generated {} titles", renamed).green());
        }
    }

    Ok(())
}

async fn find(ctx: &AppContext, prefix: &str) -> Result<Session> {
    let id = ctx.store.resolve_id(prefix).await?;
    ctx.store
        .session(&id)
        .await
        .ok_or_else(|| ChatflowError::SessionNotFound(id).into())
}

fn print_session_table(sessions: &[&Session]) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

    table.add_row(prettytable::row![
        "ID".bold(),
        "Title".bold(),
        "Messages".bold(),
        "Created".bold()
    ]);

    for session in sessions {
        let title = truncate(&session.name, TITLE_COLUMN_CHARS);
        let title = if session.pinned {
            format!("* {}", title).yellow().to_string()
        } else {
            title
        };
        let created = session
            .created_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
            .to_string();

        table.add_row(prettytable::row![
            short_id(&session.id).cyan(),
            title,
            session.messages.len(),
            created
        ]);
    }

    table.printstd();
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars - 3).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
