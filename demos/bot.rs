use clap::Parser;
use katachi::{login_sharded, Event, Intents, ShardSpec};
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;

/// minimal gateway bot: connects, logs every event it is delivered
#[derive(Parser)]
struct Args {
    /// bot token
    token: String,

    /// shard count; 0 takes the server recommendation
    #[arg(long, default_value_t = 0)]
    shards: i32,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::INFO)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();

    let intents = Intents::GUILDS | Intents::GUILD_MESSAGES;
    let result = login_sharded(
        args.token,
        intents,
        |client, event: &Event| {
            let (shard_id, _) = client.shard();
            tracing::info!(shard_id, name = event.name(), "event");
        },
        None,
        args.shards,
        ShardSpec::default(),
    )
    .await;

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "login failed");
            std::process::ExitCode::FAILURE
        }
    }
}
