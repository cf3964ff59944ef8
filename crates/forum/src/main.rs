//! Forum command line: runs entity operations against a cluster

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use ent::config::mask_url;
use ent::{ClusterConfig, Engine, Id, IslandConfig, NodeConfig, Row, Vc};
use ent_forum::ents::{COMMENTS, ORGANIZATIONS, ORGANIZATION_USERS, TOPICS};
use ent_forum::{open_engine, principal_id, server_vc, Session};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "forum")]
#[clap(about = "Forum entities over a sharded store, with privacy rules on every access")]
struct Args {
    /// Database connection URL of a single-island deployment
    #[clap(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Cluster topology JSON file (takes precedence over --database-url)
    #[clap(long, env = "ENT_CLUSTER_CONFIG")]
    cluster_config: Option<String>,

    /// Use the in-memory backend instead of a database
    #[clap(long)]
    memory: bool,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open connections on every node
    Prewarm,

    /// Create a topic as the given user
    CreateTopic {
        #[clap(long)]
        email: String,
        #[clap(long)]
        subject: String,
    },

    /// Print a comment if the given user may read it
    ShowComment {
        #[clap(long)]
        email: String,
        #[clap(long)]
        id: String,
    },

    /// Walk through users, topics, comments and organizations in memory
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ent={0},ent_forum={0},forum={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, memory) = match &args.command {
        Command::Demo => (demo_cluster(), true),
        _ => (cluster_config(&args)?, args.memory),
    };
    let engine = open_engine(config, memory)?;

    tokio::select! {
        result = run(&engine, args.command) => {
            engine.cluster().close().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing connections");
            engine.cluster().close().await;
            Ok(())
        }
    }
}

fn cluster_config(args: &Args) -> Result<ClusterConfig> {
    if let Some(path) = &args.cluster_config {
        tracing::info!("Cluster config: {}", path);
        return Ok(ClusterConfig::from_file(path)?);
    }
    if args.memory {
        return Ok(ClusterConfig::single_node("memory://"));
    }
    let url = args
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("set DATABASE_URL, --cluster-config or --memory"))?;
    tracing::info!("Database URL: {}", mask_url(url));
    let config = ClusterConfig::single_node(url);
    config.validate()?;
    Ok(config)
}

/// Three in-memory islands
fn demo_cluster() -> ClusterConfig {
    ClusterConfig {
        islands: (0..3)
            .map(|no| IslandConfig {
                no,
                nodes: vec![NodeConfig::new(format!("island{no}-master"), "memory://")],
            })
            .collect(),
        read_from_replicas: false,
        node_down_cooldown_ms: 1000,
    }
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Prewarm => {
            let failed = engine.cluster().prewarm().await;
            if !failed.is_empty() {
                bail!("prewarm failed for {}", failed.join(", "));
            }
            println!("All nodes are up");
        }
        Command::CreateTopic { email, subject } => {
            let vc = server_vc(engine, &Session::email(email)).await?;
            let id = create_topic(engine, &vc, &subject).await?;
            println!("{id}");
        }
        Command::ShowComment { email, id } => {
            let vc = server_vc(engine, &Session::email(email)).await?;
            let comment = engine.ent(COMMENTS)?.load_x(&vc, &Id::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(comment.row())?);
        }
        Command::Demo => demo(engine).await?,
    }
    Ok(())
}

async fn create_topic(engine: &Engine, vc: &Vc, subject: &str) -> Result<Id> {
    let creator = principal_id(vc)?;
    let slug: String = subject
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let fields = Row::new()
        .with("slug", slug)
        .with("creator_id", creator)
        .with("subject", subject);
    Ok(engine.ent(TOPICS)?.insert(vc, fields).await?)
}

async fn demo(engine: &Engine) -> Result<()> {
    let alice = server_vc(engine, &Session::email("alice@example.com")).await?;
    let bob = server_vc(engine, &Session::email("bob@example.com")).await?;
    println!("alice: {alice}, bob: {bob}");

    let topic = create_topic(engine, &alice, "Sharding entities").await?;
    let comments = engine.ent(COMMENTS)?;
    let comment = comments
        .insert(
            &alice,
            Row::new()
                .with("topic_id", &topic)
                .with("creator_id", principal_id(&alice)?)
                .with("message", "Comments live next to their topic"),
        )
        .await?;
    println!(
        "topic {topic} on island {:?}, comment {comment} on island {:?}",
        topic.island(),
        comment.island()
    );

    let loaded = comments.load_x(&alice, &comment).await?;
    println!("alice reads: {}", serde_json::to_string(loaded.row())?);
    match comments.load_x(&bob, &comment).await {
        Err(e) if e.is_authorization() => println!("bob is denied: {e}"),
        Err(e) => return Err(e.into()),
        Ok(_) => bail!("bob must not read alice's comment"),
    }

    let omni = Vc::guest().to_omni_dangerous();
    let org = engine
        .ent(ORGANIZATIONS)?
        .insert(&omni, Row::new().with("name", "Acme"))
        .await?;
    engine
        .ent(ORGANIZATION_USERS)?
        .insert(
            &omni,
            Row::new()
                .with("organization_id", &org)
                .with("user_id", principal_id(&bob)?),
        )
        .await?;
    let organizations = engine.ent(ORGANIZATIONS)?;
    let visible = organizations.load_nullable(&bob, &org).await?.is_some();
    println!("bob sees organization {org}: {visible}");
    match organizations.load(&alice, &org).await {
        Err(e) if e.is_authorization() => println!("alice is denied: {e}"),
        Err(e) => return Err(e.into()),
        Ok(_) => bail!("alice is not a member of {org}"),
    }
    Ok(())
}
