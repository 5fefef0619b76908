use log::{error, info};
use meeting_tally::commands::{self, Reply};
use meeting_tally::config::Config;
use meeting_tally::db::Database;
use meeting_tally::tasks::stalled_counts::check_stalled_counts_task;
use meeting_tally::{VoteLifecycle, auth};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();

    // Initialize database
    let database = match Database::new(&config.database_url, config.max_connections).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    info!("Using database {}", config.database_url);

    let lifecycle = VoteLifecycle::new(
        Arc::clone(&database),
        auth::from_admin_users(&config.admin_users),
    );

    let runner = lifecycle.runner().clone();
    let every = config.stalled_check_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        check_stalled_counts_task(database, runner, every).await;
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read from stdin: {}", e);
                break;
            }
        };

        match commands::handle_line(&lifecycle, &config.console_actor, &line).await {
            Some(Reply::Text(text)) => {
                let written = stdout.write_all(format!("{}\n", text).as_bytes()).await;
                if let Err(e) = written.and(stdout.flush().await) {
                    error!("Failed to write to stdout: {}", e);
                    break;
                }
            }
            Some(Reply::Quit) => break,
            None => {}
        }
    }
    info!("Console closed");
}
