use financial_dispatch_core::{config::AppConfig, dispatch::build_dispatcher, MessageRole};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = AppConfig::from_env()?;
    let dispatcher = build_dispatcher(&config)?;
    let session_id = Uuid::new_v4();

    info!(session_id = %session_id, "Interactive session started");
    println!("Financial assistant. Type a question, /reset to start over, /quit to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                dispatcher.reset_session(session_id).await?;
                println!("Session reset.");
                continue;
            }
            _ => {}
        }

        // Ctrl-C cancels the running turn only
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });

        let result = dispatcher.handle_message(session_id, line, cancel).await;
        interrupt.abort();

        match result {
            Ok(report) => {
                match report.reply {
                    Some(reply) if reply.role == MessageRole::System => println!("[system] {}", reply.content),
                    Some(reply) => println!("{}", reply.content),
                    None => println!("(no answer)"),
                }
                info!(rounds = report.rounds, finish = ?report.finish, "Turn done");
            }
            Err(e) => eprintln!("Turn failed: {}", e),
        }
    }

    Ok(())
}
