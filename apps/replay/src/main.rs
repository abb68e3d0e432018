use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shared::{
    domain::{ChannelId, Post, TeamId},
    protocol::RawEvent,
};
use sync_engine::{
    config::load_settings, decoder, display::DisplayState, http_api::HttpChatApi, unreads::UnreadCounts,
    EngineEvent, LocalIdentity, MutationClient, PaginationClient, SyncEngine,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    username: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feeds a JSON-lines file of push events through an offline engine and
    /// prints the resulting channel state.
    Replay {
        file: PathBuf,
        #[arg(long)]
        with_posts: bool,
    },
    /// Connects to the configured server and prints engine notifications.
    Listen {
        #[arg(long)]
        team: Vec<String>,
    },
}

#[derive(Serialize)]
struct ChannelReport {
    channel_id: ChannelId,
    unreads: UnreadCounts,
    display: DisplayState,
    #[serde(skip_serializing_if = "Option::is_none")]
    posts: Option<Vec<Post>>,
}

#[derive(Serialize)]
struct TeamReport {
    team_id: TeamId,
    unreads: UnreadCounts,
}

#[derive(Serialize)]
struct ReplayReport {
    events: usize,
    rejected: usize,
    channels: Vec<ChannelReport>,
    teams: Vec<TeamReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let identity = LocalIdentity::new(cli.user_id.as_str(), cli.username.as_str());
    let settings = load_settings()?;

    match cli.command {
        Command::Replay { file, with_posts } => {
            let engine = SyncEngine::offline(settings, &identity)?;
            let report = replay(&engine, &file, with_posts)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Listen { team } => {
            let api = Arc::new(HttpChatApi::new(
                &settings.server_url,
                settings.auth_token.clone(),
                identity.user_id.clone(),
            )?);
            let pagination: Arc<dyn PaginationClient> = api.clone();
            let mutations: Arc<dyn MutationClient> = api;
            let engine = SyncEngine::new(settings, &identity, pagination, mutations)?;
            listen(engine, team).await?;
        }
    }
    Ok(())
}

fn replay(engine: &SyncEngine, path: &PathBuf, with_posts: bool) -> Result<ReplayReport> {
    let file = File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;
    let mut channels = BTreeSet::new();
    let mut teams = BTreeSet::new();
    let mut events = 0;
    let mut rejected = 0;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events += 1;
        let decoded = serde_json::from_str::<RawEvent>(&line)
            .map_err(anyhow::Error::from)
            .and_then(|raw| decoder::decode(raw).map_err(anyhow::Error::from));
        let event = match decoded {
            Ok(event) => event,
            Err(err) => {
                rejected += 1;
                warn!(line = index + 1, error = %err, "replay: skipping event");
                continue;
            }
        };
        let report = engine.handle_event(&event);
        for (handler, failure) in report.failures() {
            warn!(line = index + 1, handler, %failure, "replay: handler failed");
        }
        channels.extend(event.channel_id.clone());
        teams.extend(event.team_id.clone());
    }
    info!(events, rejected, channels = channels.len(), "replay: finished");

    Ok(ReplayReport {
        events,
        rejected,
        channels: channels
            .into_iter()
            .map(|channel_id| ChannelReport {
                unreads: engine.channel_unreads(&channel_id),
                display: engine.display_state(&channel_id),
                posts: with_posts.then(|| engine.channel_posts(&channel_id)),
                channel_id,
            })
            .collect(),
        teams: teams
            .into_iter()
            .map(|team_id| TeamReport {
                unreads: engine.team_unreads(&team_id),
                team_id,
            })
            .collect(),
    })
}

async fn listen(engine: Arc<SyncEngine>, teams: Vec<String>) -> Result<()> {
    let mut notifications = engine.subscribe();
    for team in teams {
        let team_id = TeamId::from(team.as_str());
        engine
            .load_team(&team_id)
            .await
            .with_context(|| format!("failed to load team {team_id}"))?;
        info!(%team_id, unreads = ?engine.team_unreads(&team_id), "listen: team loaded");
    }
    let event_loop = engine.connect().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = notifications.recv() => match received {
                Ok(EngineEvent::Changed { concern, channel_id, team_id }) => {
                    let display_state = channel_id.as_ref().map(|channel_id| engine.display_state(channel_id));
                    info!(?concern, ?channel_id, ?team_id, display = ?display_state, "listen: changed");
                }
                Ok(EngineEvent::Error(message)) => warn!(%message, "listen: engine error"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "listen: notifications lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    event_loop.abort();
    Ok(())
}
