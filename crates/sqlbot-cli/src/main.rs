use sqlbot_core::{BotConfig, InMemoryThreadStore, Orchestrator, SqliteDatabase};
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BotConfig::load();
    let db = Arc::new(SqliteDatabase::seeded_in_memory().await?);
    let memory = Arc::new(InMemoryThreadStore::new(config.clone()));
    let orchestrator = Arc::new(Orchestrator::new(config, db, memory));

    let thread_id = uuid::Uuid::new_v4().to_string();
    println!("SQL analytics chat — type your question, or Ctrl+D to exit.");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = orchestrator.process(&thread_id, line).await;
        println!("{reply}");
    }

    Ok(())
}
