//! `loopwright config`: Configuration management commands.

use loopwright_agent::StrategyRegistry;
use loopwright_config::{AppConfig, ApprovalMode};

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    if config_path.exists() && !force {
        println!("⚠️  Config already exists at: {}", config_path.display());
        println!("   Run with --force to overwrite it.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("✅ Created config.toml at: {}", config_path.display());
    Ok(())
}

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let warnings = warnings_for(&config);
            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Max steps:   {}", config.runtime.max_steps);
            println!("   Max tokens:  {}", config.context.max_tokens);
            println!("   Strategy:    {}", config.compaction.strategy);
            println!("   Approval:    {:?}", config.approval.mode);
            println!("   History:     {}", config.history.backend);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Problems that load-time validation lets through.
fn warnings_for(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let registry = StrategyRegistry::with_defaults();
    if !registry.contains(&config.compaction.strategy) {
        warnings.push(format!(
            "Unknown compaction strategy '{}' (known: {})",
            config.compaction.strategy,
            registry.tags().join(", ")
        ));
    }

    if config.approval.mode == ApprovalMode::AutoApprove {
        warnings.push("Approval mode auto-approve runs every tool without asking".into());
    }

    if config.approval.timeout_secs == 0 {
        warnings.push("approval.timeout_secs = 0 denies every manual request at once".into());
    }

    if config.history.backend == "memory" {
        warnings.push("History backend 'memory' is lost when the process exits".into());
    }

    warnings
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
