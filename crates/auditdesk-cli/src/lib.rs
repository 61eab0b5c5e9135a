use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use auditdesk_client_core::session::AUTO_REFRESH_INTERVAL;
use auditdesk_client_core::{
    ApiClient, ClientConfig, ColumnDef, Credentials, FileStore, HttpAuthApi, LogNotifier,
    NodeId, Session, SortOrder, TableController, TableQuery, TokenVault, TreeConfig,
    TreeController,
};
use auditdesk_live::{ChannelState, LiveChannel, LiveConfig, LiveEvent};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

const STORE_DIR: &str = ".auditdesk";
const STORE_FILE: &str = "store.json";

#[derive(Parser, Debug)]
#[command(name = "auditdesk")]
#[command(about = "Operator CLI for the Auditdesk admin API")]
pub struct AuditdeskCli {
    /// REST base URL, e.g. https://audit.example.com/api
    #[arg(long, global = true, env = "AUDITDESK_API_BASE_URL")]
    pub api_url: Option<String>,

    /// WebSocket endpoint of the live channel.
    #[arg(long, global = true, env = "AUDITDESK_WS_BASE_URL")]
    pub ws_url: Option<String>,

    /// Token store. Defaults to ~/.auditdesk/store.json.
    #[arg(long, global = true, env = "AUDITDESK_STORE")]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and persist the token pair
    Login {
        #[arg(long, short)]
        username: String,
        #[arg(long, env = "AUDITDESK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Log out and clear stored tokens
    Logout,
    /// Validate stored tokens and show the session
    Status,
    /// Fetch one page of a paginated resource
    Table(TableArgs),
    /// Browse or edit a hierarchical resource
    Tree(TreeArgs),
    /// Follow online users and the audit log feed
    Live {
        /// Page reported to the server as the current location.
        #[arg(long, default_value = "/")]
        page: String,
    },
}

#[derive(Args, Debug)]
pub struct TableArgs {
    /// Resource path, e.g. /users
    pub resource: String,
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = auditdesk_client_core::table::DEFAULT_PAGE_SIZE)]
    pub size: u32,
    #[arg(long)]
    pub search: Option<String>,
    /// Column to sort by.
    #[arg(long)]
    pub sort: Option<String>,
    /// Sort descending instead of ascending.
    #[arg(long, requires = "sort")]
    pub desc: bool,
    /// Filter as key=value; repeatable.
    #[arg(long = "filter", value_parser = parse_filter)]
    pub filters: Vec<(String, String)>,
}

impl TableArgs {
    /// The complete query these arguments describe, so the page is read once.
    pub fn query(&self) -> TableQuery {
        TableQuery {
            page: self.page,
            page_size: self.size,
            search: self.search.clone().unwrap_or_default(),
            filters: self
                .filters
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect(),
            sort_key: self.sort.clone(),
            sort_order: if self.desc { SortOrder::Desc } else { SortOrder::Asc },
        }
    }
}

#[derive(Args, Debug)]
pub struct TreeArgs {
    /// Resource path, e.g. /audit-units
    pub base_path: String,
    #[command(subcommand)]
    pub command: TreeCommand,
}

#[derive(Subcommand, Debug)]
pub enum TreeCommand {
    /// Print the root and any expanded branches
    Show {
        /// Expand every branch before printing.
        #[arg(long)]
        expand_all: bool,
    },
    /// Reparent a node
    Move { id: NodeId, new_parent: NodeId },
    /// Search nodes by code or name
    Search { query: String },
    /// Expand the ancestors of a node and print the tree
    Reveal { id: NodeId },
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

struct CliContext {
    config: ClientConfig,
    session: Arc<Session>,
}

impl CliContext {
    fn open(cli: &AuditdeskCli) -> Result<Self> {
        let mut config = ClientConfig::from_env()?;
        if cli.api_url.is_some() || cli.ws_url.is_some() {
            let api = cli.api_url.as_deref().unwrap_or(&config.api_base_url);
            let ws = cli.ws_url.as_deref().unwrap_or(&config.ws_base_url);
            config = ClientConfig::new(api, ws)?;
        }
        let path = match &cli.store {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("cannot locate home directory; pass --store"))?
                .join(STORE_DIR)
                .join(STORE_FILE),
        };
        let store = FileStore::open(&path)
            .with_context(|| format!("open token store {}", path.display()))?;
        let vault = TokenVault::new(Arc::new(store));
        let session = Session::new(vault, Arc::new(HttpAuthApi::new(&config)?));
        Ok(Self { config, session })
    }

    fn api(&self) -> Result<ApiClient> {
        Ok(ApiClient::new(&self.config, Arc::clone(&self.session))?)
    }

    async fn require_login(&self) -> Result<()> {
        if !self.session.check_token().await {
            bail!("not logged in; run `auditdesk login`");
        }
        Ok(())
    }
}

pub async fn run(cli: AuditdeskCli) -> Result<()> {
    let ctx = CliContext::open(&cli)?;
    let mut out = std::io::stdout().lock();
    match cli.command {
        Commands::Login { username, password } => {
            ctx.session
                .authenticate(&Credentials::new(username, password))
                .await
                .map_err(|error| anyhow!(error.user_message()))?;
            let state = ctx.session.state();
            writeln!(
                out,
                "logged in as {} (admin: {})",
                state.username.unwrap_or_default(),
                state.is_admin
            )?;
        }
        Commands::Logout => {
            ctx.session.logout().await;
            writeln!(out, "logged out")?;
        }
        Commands::Status => {
            let authenticated = ctx.session.check_token().await;
            let state = ctx.session.state();
            if authenticated {
                writeln!(
                    out,
                    "authenticated as {} (admin: {})",
                    state.username.unwrap_or_default(),
                    state.is_admin
                )?;
            } else {
                writeln!(out, "not authenticated")?;
            }
        }
        Commands::Table(args) => {
            ctx.require_login().await?;
            run_table(&ctx, args, &mut out).await?;
        }
        Commands::Tree(args) => {
            ctx.require_login().await?;
            run_tree(&ctx, args, &mut out).await?;
        }
        Commands::Live { page } => {
            ctx.require_login().await?;
            run_live(&ctx, page, &mut out).await?;
        }
    }
    Ok(())
}

async fn run_table(ctx: &CliContext, args: TableArgs, out: &mut impl Write) -> Result<()> {
    let columns = args
        .sort
        .iter()
        .map(|key| ColumnDef::new(key.clone(), key.clone()))
        .collect();
    let query = args.query();
    let table = TableController::<Value>::new(ctx.api()?, args.resource, columns)
        .with_notifier(Arc::new(LogNotifier));
    table.apply_query(query).await?;

    let snapshot = table.snapshot();
    for row in &snapshot.data {
        writeln!(out, "{row}")?;
    }
    writeln!(
        out,
        "page {}/{} ({} total)",
        snapshot.query.page,
        table.page_count(),
        snapshot.total
    )?;
    Ok(())
}

async fn run_tree(ctx: &CliContext, args: TreeArgs, out: &mut impl Write) -> Result<()> {
    let tree = TreeController::new(ctx.api()?, args.base_path, TreeConfig::default())
        .with_notifier(Arc::new(LogNotifier));
    tree.ensure_root().await?;
    match args.command {
        TreeCommand::Show { expand_all } => {
            if expand_all {
                let expanded = tree.expand_all().await?;
                info!(expanded, "expanded tree");
            }
        }
        TreeCommand::Move { id, new_parent } => {
            tree.reveal(id).await?;
            let moved = tree.move_node(id, new_parent).await?;
            writeln!(out, "moved {} under {new_parent}", moved.code)?;
            tree.reveal(id).await?;
        }
        TreeCommand::Search { query } => {
            let hits = tree.search(&query).await?.unwrap_or_default();
            for hit in hits {
                writeln!(out, "{:>6}  {}  {}  {}", hit.id, hit.code, hit.name, hit.path)?;
            }
            return Ok(());
        }
        TreeCommand::Reveal { id } => {
            tree.reveal(id).await?;
        }
    }
    for row in tree.visible_rows() {
        let marker = match (row.expanded, row.node.may_have_children()) {
            (true, _) => "-",
            (false, true) => "+",
            (false, false) => " ",
        };
        writeln!(
            out,
            "{}{marker} {} {} [{}]",
            "  ".repeat(row.depth),
            row.node.code,
            row.node.name,
            row.node.id
        )?;
    }
    Ok(())
}

async fn run_live(ctx: &CliContext, page: String, out: &mut impl Write) -> Result<()> {
    let _supervisor = ctx.session.spawn_supervisor(AUTO_REFRESH_INTERVAL);
    let channel = LiveChannel::new(
        Arc::clone(&ctx.session),
        LiveConfig::from_client_config(&ctx.config),
    );
    channel.navigate(page);
    let mut events = channel.subscribe();
    let mut states = channel.watch_state();
    channel.start()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LiveEvent::OnlineUsers(users)) => {
                    let names = users.iter().map(|user| user.username.as_str()).collect::<Vec<_>>();
                    writeln!(out, "online ({}): {}", users.len(), names.join(", "))?;
                }
                Ok(LiveEvent::Log(entry)) => {
                    writeln!(
                        out,
                        "{} {} {} {}",
                        entry.timestamp.unwrap_or_default(),
                        entry.username.unwrap_or_default(),
                        entry.action,
                        entry.outcome.unwrap_or_default()
                    )?;
                }
                Err(error) => warn!(%error, "live event stream lagged"),
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match state {
                    ChannelState::Connected => {
                        channel.request_online_users();
                    }
                    ChannelState::Failed { message } => bail!(message),
                    ChannelState::Disconnected => bail!("session ended"),
                    ChannelState::Connecting | ChannelState::Reconnecting { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    channel.stop();
    Ok(())
}
