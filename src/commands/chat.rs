//! Interactive chat mode handler.
//!
//! Wires the provider, session store, quota gate and title generator into a
//! [`ChatPipeline`] and runs a readline loop (or a single prompt) that
//! streams each reply to stdout as it arrives.

use super::special_commands::{parse_special_command, print_help, SpecialCommand};
use super::AppContext;
use crate::chat::{ChatPipeline, PipelineEvent, PipelineSettings, TitleGenerator, TurnOutcome};
use crate::config::Config;
use crate::error::{ChatflowError, Result};
use crate::providers::create_provider;
use crate::storage::{MessageStatus, Role, Session};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Start chat mode
///
/// # Arguments
///
/// * `config` - Global configuration (consumed)
/// * `resume` - Session id or prefix to continue
/// * `model` - Optional override for the configured model
/// * `prompt` - Send this message once and exit instead of looping
///
/// # Errors
///
/// Returns error if the provider or storage cannot be initialized, or the
/// session to resume does not exist
pub async fn run_chat(
    mut config: Config,
    resume: Option<String>,
    model: Option<String>,
    prompt: Option<String>,
) -> Result<()> {
    if let Some(model) = model {
        tracing::debug!("Using model override: {}", model);
        config.provider.openai.model = model;
    }

    let provider = create_provider(&config.provider)?;
    let ctx = AppContext::build(config).await?;
    let titles = Arc::new(TitleGenerator::new(provider.clone(), ctx.store.clone()));

    let (tx, mut events) = mpsc::unbounded_channel();
    let pipeline = ChatPipeline::new(
        ctx.store.clone(),
        ctx.quota.clone(),
        provider,
        titles.clone(),
        ctx.identity.clone(),
        PipelineSettings::from_config(&ctx.config),
    )
    .with_events(tx);

    if let Some(prefix) = resume {
        let session_id = ctx.store.resolve_id(&prefix).await?;
        if let Some(session) = ctx.store.session(&session_id).await {
            print_transcript(&session);
        }
        pipeline.set_active_session(Some(session_id)).await;
    }

    if let Some(text) = prompt {
        let outcome = stream_turn(&pipeline, &mut events, &text).await?;
        if let TurnOutcome::Completed {
            title_task: Some(task),
            ..
        } = outcome
        {
            let _ = task.await;
        }
        return Ok(());
    }

    let backfill = {
        let titles = titles.clone();
        tokio::spawn(async move {
            titles.backfill().await;
        })
    };

    let mut pending_titles: Vec<JoinHandle<()>> = vec![backfill];
    let mut rl = DefaultEditor::new()
        .map_err(|e| ChatflowError::Config(format!("Failed to start line editor: {}", e)))?;

    print_welcome_banner(pipeline.model());

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);

                match parse_special_command(trimmed) {
                    Ok(SpecialCommand::None) => {}
                    Ok(SpecialCommand::Exit) => break,
                    Ok(command) => {
                        if let Err(e) = handle_special(&ctx, &pipeline, command).await {
                            eprintln!("{}", format!("Error: {}", e).red());
                        }
                        continue;
                    }
                    Err(e) => {
                        eprintln!("{}", e.to_string().red());
                        continue;
                    }
                }

                match stream_turn(&pipeline, &mut events, trimmed).await {
                    Ok(TurnOutcome::Completed {
                        title_task: Some(task),
                        ..
                    }) => pending_titles.push(task),
                    Ok(_) => {}
                    Err(e) => eprintln!("{}", format!("Error: {}", e).red()),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                tracing::error!("Readline error: {:?}", err);
                break;
            }
        }
    }

    for task in pending_titles {
        let _ = task.await;
    }
    println!("Goodbye!");
    Ok(())
}

/// Submit one message and render the stream until the turn ends
///
/// Ctrl-C while streaming cancels the turn instead of exiting.
async fn stream_turn(
    pipeline: &ChatPipeline,
    events: &mut mpsc::UnboundedReceiver<PipelineEvent>,
    text: &str,
) -> Result<TurnOutcome> {
    let cancel = CancellationToken::new();
    let submit = pipeline.submit(text, cancel.clone());
    tokio::pin!(submit);

    let outcome = loop {
        tokio::select! {
            outcome = &mut submit => break outcome?,
            Some(event) = events.recv() => render_event(&event),
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::debug!("Cancelling response on Ctrl-C");
                cancel.cancel();
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        render_event(&event);
    }
    render_outcome(&outcome);
    Ok(outcome)
}

fn render_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Delta { delta, .. } => {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        PipelineEvent::Notice(notice) => println!("{}", notice.yellow()),
        PipelineEvent::SessionCreated { session_id } => {
            tracing::debug!(session_id = %session_id, "Started new session");
        }
        PipelineEvent::StateChanged(state) => {
            tracing::trace!(state = ?state, "Pipeline state");
        }
    }
}

fn render_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed { usage, .. } => {
            println!();
            if let Some(usage) = usage {
                println!(
                    "{}",
                    format!(
                        "[{} prompt + {} completion tokens]",
                        usage.prompt_tokens, usage.completion_tokens
                    )
                    .dimmed()
                );
            }
            println!();
        }
        TurnOutcome::QuotaDenied { .. } => println!(),
        TurnOutcome::Cancelled { .. } => {
            println!();
            println!("{}\n", "[response stopped]".yellow());
        }
        TurnOutcome::Failed { message, .. } => {
            println!();
            eprintln!("{}\n", message.red());
        }
    }
}

async fn handle_special(
    ctx: &AppContext,
    pipeline: &ChatPipeline,
    command: SpecialCommand,
) -> Result<()> {
    match command {
        SpecialCommand::New => {
            pipeline.set_active_session(None).await;
            println!("{}", "Your next message starts a new session.".green());
        }
        SpecialCommand::Fork(at) => {
            let session_id = current_session(pipeline).await?;
            let fork_id = match at {
                Some(prefix) => {
                    let session = ctx
                        .store
                        .session(&session_id)
                        .await
                        .ok_or_else(|| ChatflowError::SessionNotFound(session_id.clone()))?;
                    let message_id = resolve_message_id(&session, &prefix)?;
                    ctx.store.fork_at(&session_id, &message_id).await?
                }
                None => {
                    let messages = ctx
                        .store
                        .session(&session_id)
                        .await
                        .map(|s| s.messages)
                        .unwrap_or_default();
                    ctx.store.fork(&messages).await?
                }
            };
            pipeline.set_active_session(Some(fork_id.clone())).await;
            println!(
                "{}",
                format!("Continuing in forked session {}", short_id(&fork_id)).green()
            );
        }
        SpecialCommand::Resume(prefix) => {
            let session_id = ctx.store.resolve_id(&prefix).await?;
            if let Some(session) = ctx.store.session(&session_id).await {
                print_transcript(&session);
            }
            pipeline.set_active_session(Some(session_id)).await;
        }
        SpecialCommand::Rename(title) => {
            let session_id = current_session(pipeline).await?;
            ctx.store.rename(&session_id, &title).await?;
            println!("{}", format!("Renamed session to '{}'", title.trim()).green());
        }
        SpecialCommand::Pin => {
            let session_id = current_session(pipeline).await?;
            let pinned = ctx.store.toggle_pin(&session_id).await?;
            let label = if pinned { "Pinned" } else { "Unpinned" };
            println!("{}", format!("{} session {}", label, short_id(&session_id)).green());
        }
        SpecialCommand::Help => print_help(),
        SpecialCommand::Exit | SpecialCommand::None => {}
    }
    Ok(())
}

async fn current_session(pipeline: &ChatPipeline) -> Result<String> {
    pipeline.active_session().await.ok_or_else(|| {
        ChatflowError::Validation("No active session yet; send a message first".into()).into()
    })
}

/// Full id of the message in `session` whose id starts with `prefix`
pub(crate) fn resolve_message_id(session: &Session, prefix: &str) -> Result<String> {
    let matches: Vec<&str> = session
        .messages
        .iter()
        .filter(|m| m.id.starts_with(prefix))
        .map(|m| m.id.as_str())
        .collect();
    match matches.as_slice() {
        [one] => Ok(one.to_string()),
        [] => Err(ChatflowError::MessageNotFound(prefix.to_string()).into()),
        _ => Err(ChatflowError::Validation(format!(
            "Message id prefix '{}' is ambiguous",
            prefix
        ))
        .into()),
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Print every message of a session with its short id
pub(crate) fn print_transcript(session: &Session) {
    println!("\n{}", session.name.bold());
    for message in &session.messages {
        let label = match message.role {
            Role::User => "you".cyan(),
            Role::Assistant => "assistant".green(),
        };
        let status = match message.status {
            MessageStatus::Complete => String::new(),
            other => format!(" ({})", other.as_str()),
        };
        println!(
            "{} {}{}\n{}\n",
            label.bold(),
            short_id(&message.id).dimmed(),
            status.yellow(),
            message.content
        );
    }
}

fn print_welcome_banner(model: &str) {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║                Chatflow Interactive Chat                     ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Model: {}", model.cyan());
    println!("Type '/help' for available commands, 'exit' to quit\n");
}
