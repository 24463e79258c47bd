//! `loopwright history`: Session history inspection and maintenance.

use std::sync::Arc;

use loopwright_agent::{CompactionReport, ContextManager, OldestEvictionStrategy};
use loopwright_config::AppConfig;
use loopwright_core::history::HistoryStore;
use loopwright_core::message::{Message, SessionId};
use tokio_util::sync::CancellationToken;

const PREVIEW_CHARS: usize = 100;

async fn open_store(
    config: &AppConfig,
) -> Result<Arc<dyn HistoryStore>, Box<dyn std::error::Error>> {
    let store = loopwright_history::open(&config.history)
        .await
        .map_err(|e| format!("Failed to open history store: {e}"))?;
    tracing::debug!(backend = store.name(), path = %config.history.resolved_path().display(), "History store opened");
    Ok(store)
}

fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

fn context_for(config: &AppConfig, store: Arc<dyn HistoryStore>, session: &str) -> ContextManager {
    ContextManager::new(SessionId::from(session), store).with_config(&config.context)
}

pub async fn sessions() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let store = open_store(&config).await?;

    let mut sessions = store.sessions().await?;
    sessions.sort();

    println!("🗂️  Sessions ({} backend)", store.name());
    if sessions.is_empty() {
        println!("   No stored sessions.");
    }
    for session in &sessions {
        let count = store.len(session).await?;
        println!("  {:<40} {count:>6} messages", session.as_str());
    }
    Ok(())
}

pub async fn show(session: &str, raw: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let ctx = context_for(&config, store, session);

    let messages = if raw {
        ctx.history().await?
    } else {
        ctx.get_formatted_messages().await?
    };

    if messages.is_empty() {
        println!("   No messages for session '{session}'.");
        return Ok(());
    }
    for (i, message) in messages.iter().enumerate() {
        println!("  {i:>4}. {}", describe(message));
    }
    Ok(())
}

pub async fn stats(session: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let ctx = context_for(&config, store, session);

    let stored = ctx.history().await?;
    let view = ctx.get_formatted_messages().await?;
    let estimate = ctx.get_context_token_estimate().await?;
    let summaries = stored.iter().filter(|m| m.is_summary()).count();
    let budget = ctx.max_tokens().max(1);

    println!("📊 History Statistics");
    println!("=====================");
    println!("  Session:        {session}");
    println!("  Stored:         {} messages", stored.len());
    println!("  Summaries:      {summaries}");
    println!("  Model view:     {} messages", view.len());
    println!(
        "  Token estimate: {} / {} ({:.1}%)",
        estimate.estimated,
        budget,
        estimate.estimated as f64 * 100.0 / budget as f64
    );
    Ok(())
}

pub async fn compact(session: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let mut ctx = context_for(&config, store, session);

    println!("🗜️  Compacting session '{session}'...");
    match evict_oldest(&mut ctx, &config).await? {
        Some(report) => {
            println!(
                "   ✅ {} → {} messages, ~{} → ~{} tokens",
                report.before_messages,
                report.after_messages,
                report.before_tokens,
                report.after_tokens
            );
        }
        None => println!("   Nothing to compact."),
    }
    Ok(())
}

pub async fn reset(session: &str, confirm: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !confirm {
        println!("⚠️  This will delete ALL history for session '{session}' permanently.");
        println!("   Run with --confirm to proceed:");
        println!("   loopwright history reset --session {session} --confirm");
        return Ok(());
    }

    let config = load_config()?;
    let store = open_store(&config).await?;
    let mut ctx = context_for(&config, store, session);
    ctx.reset().await?;
    println!("🗑️  History for session '{session}' cleared.");
    Ok(())
}

/// Run the mechanical eviction strategy once.
async fn evict_oldest(
    ctx: &mut ContextManager,
    config: &AppConfig,
) -> loopwright_core::Result<Option<CompactionReport>> {
    let strategy = OldestEvictionStrategy::new(&config.compaction, ctx.estimator().clone());
    ctx.compact_now(&strategy, &CancellationToken::new()).await
}

/// One-line rendering of a message for listings.
fn describe(message: &Message) -> String {
    let mut label = message.role.to_string();
    if message.is_summary() {
        label.push_str(" [summary]");
    }
    if let Some(name) = &message.tool_name {
        label.push_str(&format!(" ({name})"));
    }

    let mut text = message.text().replace('\n', " ");
    if !message.tool_calls.is_empty() {
        let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
        text = format!("{text} → calls {}", names.join(", "));
    }
    if text.chars().count() > PREVIEW_CHARS {
        text = text.chars().take(PREVIEW_CHARS).collect::<String>() + "…";
    }
    format!("{label:<18} {}", text.trim())
}
