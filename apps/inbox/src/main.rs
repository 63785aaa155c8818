use std::sync::Arc;

use anyhow::{Context as _, Result};
use backend_sdk::{AccountGateway, LiveFeed, MessageGateway, RealtimeClient, RestClient, Session};
use change_bus::LocalBus;
use clap::Parser;
use inbox_core::cli::{Cli, Command, ConversationsArgs, OpenArgs};
use inbox_core::config::Config;
use inbox_core::context::{AppContext, ModuleAccess};
use inbox_core::livechat::directory::subtitle;
use inbox_core::livechat::render::to_text;
use inbox_core::livechat::{ConversationDirectory, LivechatSession};
use inbox_core::logging;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initializing logging")?;

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(target: "inbox", backend = %config.backend_url, "configuration loaded");

    let (rest, session) = connect(&config).await?;
    let rest = Arc::new(rest);

    match cli.command {
        Command::Conversations(args) => list_conversations(rest, args).await,
        Command::Agents => list_agents(rest).await,
        Command::Open(args) => open(rest, session, &config, args).await,
    }
}

async fn connect(config: &Config) -> Result<(RestClient, Option<Session>)> {
    let mut rest = RestClient::new(config.backend_url.clone(), config.anon_key.clone());
    rest.set_access_token(config.access_token.clone());
    let (Some(email), Some(password)) = (config.email.as_deref(), config.password.as_deref())
    else {
        return Ok((rest, None));
    };
    let session = rest
        .sign_in(email, password)
        .await
        .with_context(|| format!("signing in as {email}"))?;
    info!(target: "inbox", user = %session.user.id, "signed in");
    rest.set_access_token(Some(session.access_token.clone()));
    Ok((rest, Some(session)))
}

async fn list_conversations(rest: Arc<RestClient>, args: ConversationsArgs) -> Result<()> {
    let mut directory = ConversationDirectory::new(rest);
    directory.load_agents().await;
    let rows = directory
        .load(args.search.as_deref(), args.agent.as_deref())
        .await
        .to_vec();
    if rows.is_empty() {
        println!("No conversations");
        return Ok(());
    }
    for row in &rows {
        let agent = row
            .active_agent_id
            .as_deref()
            .map(|id| directory.agent_name(id).unwrap_or(id).to_string())
            .unwrap_or_else(|| "unassigned".to_string());
        println!(
            "{:<24} {:<32} {:<20} {}",
            row.contact_id,
            row.display_name(),
            agent,
            subtitle(row)
        );
    }
    Ok(())
}

async fn list_agents(rest: Arc<RestClient>) -> Result<()> {
    let mut directory = ConversationDirectory::new(rest);
    for agent in directory.load_agents().await {
        println!("{:<24} {}", agent.id, agent.display_name);
    }
    Ok(())
}

async fn open(
    rest: Arc<RestClient>,
    session: Option<Session>,
    config: &Config,
    args: OpenArgs,
) -> Result<()> {
    let account: &dyn AccountGateway = rest.as_ref();
    let context = AppContext::load(account, session.clone()).await;
    if context.is_signed_in() {
        anyhow::ensure!(
            context.can_open(&ModuleAccess::default()),
            "your account cannot open the livechat module"
        );
    } else {
        warn!(target: "inbox", "not signed in; reading with the anonymous key");
    }

    let mut directory = ConversationDirectory::new(rest.clone());
    let conversation = directory
        .resolve(&args.contact)
        .await
        .with_context(|| format!("no conversation found for {}", args.contact))?;
    println!("{} ({})", conversation.display_name(), context.theme.brand_name);
    println!("{}", subtitle(&conversation));

    let mut realtime = RealtimeClient::new(
        &config.backend_url,
        config.anon_key.clone(),
        Arc::new(LocalBus::new()),
    )?;
    let token = session
        .as_ref()
        .map(|s| s.access_token.clone())
        .or_else(|| config.access_token.clone());
    if let Some(token) = token {
        realtime = realtime.with_access_token(token);
    }
    let gateway: Arc<dyn MessageGateway> = rest;
    let feed: Arc<dyn LiveFeed> = Arc::new(realtime);
    let chat = LivechatSession::spawn(gateway, feed, config.livechat);
    let mut views = chat.subscribe_view();
    chat.open(conversation.contact_id.clone());

    let view = views
        .wait_for(|v| v.revision > 0 && !v.initial_pending)
        .await
        .context("livechat session stopped")?
        .clone();
    print!("{}", to_text(&view.model));

    if args.follow {
        let mut printed = view.revision;
        loop {
            tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let view = views.borrow_and_update().clone();
                    if view.revision > printed {
                        printed = view.revision;
                        print!("{}", to_text(&view.model));
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    chat.close();
    chat.shutdown().await;
    Ok(())
}
