use caduceus::channels::web::{LoginResponse, ServerFrame};
use caduceus::channels::TELEGRAM_PLATFORM;
use caduceus::executor::worker::{self, Requeue};
use caduceus::executor::OrdersTree;
use caduceus::gateway::Gateway;
use caduceus::identity::IdentityStore;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "caduceus")]
#[command(about = "Caduceus CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config with a token secret, users.json, orders tree).
    Init {
        /// Config file path (default: CADUCEUS_CONFIG_PATH or ~/.caduceus/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway: enabled channels, the order bridge and the outbound dispatcher.
    Gateway {
        /// Config file path (default: CADUCEUS_CONFIG_PATH or ~/.caduceus/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Build everything from the config, report what would run, and exit.
        #[arg(long)]
        check: bool,
    },

    /// Manage web users and their linked platform identities.
    User {
        /// Config file path (default: CADUCEUS_CONFIG_PATH or ~/.caduceus/config.json)
        #[arg(long, short, value_name = "PATH", global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: UserAction,
    },

    /// Inspect and repair the orders tree.
    Orders {
        /// Config file path (default: CADUCEUS_CONFIG_PATH or ~/.caduceus/config.json)
        #[arg(long, short, value_name = "PATH", global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: OrdersAction,
    },

    /// Chat through the web channel of a running gateway (interactive).
    Chat {
        /// Config file path (default: CADUCEUS_CONFIG_PATH or ~/.caduceus/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        username: String,

        /// Password (default: CADUCEUS_PASSWORD env, else prompt)
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user. Prints the new user id.
    Add {
        username: String,
        /// Password (default: CADUCEUS_PASSWORD env, else prompt)
        #[arg(long)]
        password: Option<String>,
    },
    /// Link a platform identity (e.g. a Telegram user id) to a user.
    Link {
        username: String,
        external_id: String,
        #[arg(long, default_value = TELEGRAM_PLATFORM)]
        platform: String,
    },
    /// List users and their links.
    List,
    /// Delete a user.
    Remove { username: String },
}

#[derive(Subcommand)]
enum OrdersAction {
    /// List claims with no worker activity for longer than the grace period.
    Orphans {
        /// Grace period in seconds (default: executor.orphanGraceSecs)
        #[arg(long)]
        grace: Option<u64>,
    },
    /// Return a claimed order to the pending state.
    Requeue { order_id: String },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("caduceus {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, check }) => run_gateway(config, check).await,
        Some(Commands::User { config, action }) => run_user(config, action).await,
        Some(Commands::Orders { config, action }) => run_orders(config, action).await,
        Some(Commands::Chat {
            config,
            username,
            password,
        }) => run_chat(config, username, password).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(caduceus::config::default_config_path);
    let dir = caduceus::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, check: bool) -> anyhow::Result<()> {
    let (config, path) = caduceus::config::load_config(config_path)?;
    caduceus::init::require_initialized(&path, &config)?;
    let gateway = Gateway::from_config(&config, &path).await?;
    if check {
        println!("config: {}", path.display());
        println!(
            "work dir: {}",
            caduceus::config::resolve_work_dir(&config, &path).display()
        );
        println!("executor: {}", gateway.executor_name());
        println!("channels: {}", gateway.channels().names().await.join(", "));
        return Ok(());
    }
    gateway.run().await
}

fn read_password(given: Option<String>) -> anyhow::Result<String> {
    use std::io::{self, Write};

    if let Some(p) = given.or_else(|| std::env::var("CADUCEUS_PASSWORD").ok()) {
        return Ok(p);
    }
    let mut stdout = io::stdout();
    write!(stdout, "password: ")?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn open_store(config_path: Option<PathBuf>) -> anyhow::Result<IdentityStore> {
    let (config, path) = caduceus::config::load_config(config_path)?;
    let store_path = caduceus::config::resolve_store_path(&config, &path);
    Ok(IdentityStore::open(store_path).await?)
}

async fn user_id_for(store: &IdentityStore, username: &str) -> anyhow::Result<String> {
    store
        .get_by_username(username)
        .await?
        .map(|u| u.user_id)
        .ok_or_else(|| anyhow::anyhow!("no such user: {}", username))
}

async fn run_user(config_path: Option<PathBuf>, action: UserAction) -> anyhow::Result<()> {
    let store = open_store(config_path).await?;
    match action {
        UserAction::Add { username, password } => {
            let password = read_password(password)?;
            let user_id = store.create_user(&username, &password).await?;
            println!("{}", user_id);
        }
        UserAction::Link {
            username,
            external_id,
            platform,
        } => {
            let user_id = user_id_for(&store, &username).await?;
            store
                .link_external_identity(&user_id, &platform, &external_id)
                .await?;
            println!("linked {}:{} to {}", platform, external_id, username);
        }
        UserAction::List => {
            for user in store.list_users().await? {
                let links: Vec<String> = user
                    .external_ids
                    .iter()
                    .map(|(platform, id)| format!("{}:{}", platform, id))
                    .collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    user.username,
                    user.user_id,
                    user.created_at.format("%Y-%m-%d %H:%M"),
                    links.join(",")
                );
            }
        }
        UserAction::Remove { username } => {
            let user_id = user_id_for(&store, &username).await?;
            if store.remove_user(&user_id).await? {
                println!("removed {}", username);
            }
        }
    }
    Ok(())
}

async fn run_orders(config_path: Option<PathBuf>, action: OrdersAction) -> anyhow::Result<()> {
    let (config, path) = caduceus::config::load_config(config_path)?;
    let tree = OrdersTree::new(caduceus::config::resolve_work_dir(&config, &path));
    match action {
        OrdersAction::Orphans { grace } => {
            let grace = grace
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.executor.orphan_grace());
            let orphans = worker::find_orphaned_claims(&tree, grace).await?;
            if orphans.is_empty() {
                println!("no orphaned claims");
            }
            for o in orphans {
                let session = o
                    .order
                    .as_ref()
                    .map(|order| order.session_key.as_str())
                    .unwrap_or("?");
                println!("{}\tidle {}s\tsession {}", o.order_id, o.idle.as_secs(), session);
            }
        }
        OrdersAction::Requeue { order_id } => match worker::requeue(&tree, &order_id).await? {
            Requeue::Restored => println!("{} is pending again", order_id),
            Requeue::Superseded => println!("{} archived; a newer order is pending", order_id),
            Requeue::NotClaimed => anyhow::bail!("no claimed order {}", order_id),
        },
    }
    Ok(())
}

async fn run_chat(
    config_path: Option<PathBuf>,
    username: String,
    password: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = caduceus::config::load_config(config_path)?;
    let web = &config.channels.web;
    let base = format!("http://{}:{}", web.bind.trim(), web.port);
    let password = read_password(password)?;

    let res = reqwest::Client::new()
        .post(format!("{}/login", base))
        .json(&serde_json::json!({ "username": username, "password": password }))
        .send()
        .await?;
    if !res.status().is_success() {
        anyhow::bail!("login failed: {}", res.status());
    }
    let login: LoginResponse = res.json().await?;

    let ws_url = format!("ws://{}:{}/ws", web.bind.trim(), web.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let connect = serde_json::json!({ "type": "connect", "token": login.token });
    ws.send(Message::Text(connect.to_string())).await?;

    let welcome = next_frame(&mut ws).await?;
    if welcome.typ == "error" {
        anyhow::bail!("{}", welcome.content);
    }
    println!("* {}", welcome.content);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        let frame = serde_json::json!({ "type": "message", "content": input });
        ws.send(Message::Text(frame.to_string())).await?;

        // System frames may arrive before the reply; a replaced session ends the chat.
        loop {
            let frame = next_frame(&mut ws).await?;
            match frame.typ.as_str() {
                "message" => {
                    println!("< {}", frame.content.trim());
                    break;
                }
                "error" => {
                    eprintln!("chat error: {}", frame.content);
                    break;
                }
                _ => {
                    println!("* {}", frame.content);
                    if frame.content == caduceus::channels::web::protocol::SESSION_REPLACED {
                        return Ok(());
                    }
                }
            }
        }
    }
    let _ = ws.close(None).await;
    Ok(())
}

async fn next_frame<S>(ws: &mut S) -> anyhow::Result<ServerFrame>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    anyhow::bail!("connection closed by gateway")
}
