mod auth;
mod config;
mod console;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use bazaar_chat::{ChatServices, PresenceTracker};
use bazaar_db::Database;
use bazaar_notify::{NotificationGateway, NotificationRouter, select_platform};
use bazaar_realtime::ChangeFeed;
use bazaar_types::toast::{ToastLevel, Toasts};

use config::ClientConfig;
use console::{Command, Console, ConsoleNavigator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "bazaar=debug".into()),
        )
        .init();

    // Config
    let config = ClientConfig::from_env()?;

    // Sign in
    let claims = auth::authenticate(&config.access_token, &config.jwt_secret)?;
    info!("Signed in as {} ({})", claims.username, claims.sub);

    // Data service
    let db = Arc::new(Database::open(&config.db_path, ChangeFeed::new())?);
    if db.get_profile(&claims.sub.to_string())?.is_none() {
        db.create_profile(&claims.sub.to_string(), &claims.username)?;
    }

    // Toasts go to the terminal
    let (toasts, mut toast_rx) = Toasts::channel();
    tokio::spawn(async move {
        while let Some(toast) = toast_rx.recv().await {
            match toast.level {
                ToastLevel::Info => println!("* {}: {}", toast.title, toast.body),
                ToastLevel::Error => println!("! {}", toast.body),
            }
        }
    });

    // Presence
    let presence = Arc::new(PresenceTracker::new(db.clone(), claims.sub));
    presence.start_heartbeat(config.heartbeat);
    let services = ChatServices::new(db.clone(), presence.clone(), toasts.clone());

    // Push
    let router = NotificationRouter::new(config.route_settle);
    let gateway = Arc::new(NotificationGateway::new(
        select_platform(None),
        db.clone(),
        router.clone(),
        toasts,
    ));
    match gateway.on_authenticated(claims.sub).await {
        Ok(state) => info!("Push gateway {:?}", state),
        Err(e) => warn!("Push registration failed: {}", e),
    }

    let (navigator, mut routes) = ConsoleNavigator::new();
    router.mount(Arc::new(navigator));

    let (mut console, mut closed) = Console::new(claims.sub, services, router, gateway);
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        if !console.execute(command).await {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Some(route) = routes.recv() => console.navigate(route).await,
            Some(id) = closed.recv() => console.leave_closed(id).await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    console.shutdown().await;
    presence.go_offline().await?;
    info!("Signed out of session");
    Ok(())
}
