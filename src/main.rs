use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dotenvy::Error as DotenvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgperf::AppContext;
use pgperf::config;
use pgperf::http;
use pgperf::loadtest::{LoadTestConfig, PerformanceTester};
use pgperf::migration::OptimizedMigration;

#[derive(Debug, Parser)]
#[command(author, version, about = "pgperf: PostgreSQL performance layer")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env PGPERF_CONFIG or built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background monitors and the HTTP API (default).
    Serve,
    /// Print one dashboard report and exit.
    Dashboard {
        /// Human-readable output instead of JSON.
        #[arg(long)]
        text: bool,
    },
    /// Analyze indexes and print the optimization script.
    IndexScript {
        /// Build every high-priority suggestion concurrently after printing.
        #[arg(long)]
        apply_high_priority: bool,
    },
    /// Issue a statement repeatedly from concurrent workers.
    LoadTest {
        #[arg(long)]
        statement: String,
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        #[arg(long, default_value_t = 1000)]
        requests: usize,
    },
    /// Plan a schema change and optionally execute it.
    Migrate {
        #[command(subcommand)]
        change: MigrationCommand,
        /// Execute the plan instead of only printing it.
        #[arg(long, global = true)]
        execute: bool,
    },
}

#[derive(Debug, Subcommand)]
enum MigrationCommand {
    AddColumn {
        table: String,
        column: String,
        data_type: String,
        #[arg(long)]
        not_null: bool,
        #[arg(long)]
        default: Option<String>,
    },
    AddIndex {
        table: String,
        #[arg(required = true, num_args = 1..)]
        columns: Vec<String>,
        #[arg(long)]
        unique: bool,
    },
    DropColumn {
        table: String,
        column: String,
    },
    ChangeType {
        table: String,
        column: String,
        from: String,
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Dashboard { text } => dashboard(config, text).await,
        Command::IndexScript {
            apply_high_priority,
        } => index_script(config, apply_high_priority).await,
        Command::LoadTest {
            statement,
            concurrency,
            requests,
        } => {
            load_test(
                config,
                LoadTestConfig {
                    statement,
                    concurrency,
                    requests,
                },
            )
            .await
        }
        Command::Migrate { change, execute } => migrate(config, change, execute).await,
    }
}

async fn serve(config: config::AppConfig) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let ctx = AppContext::build(config).await?;
    let handles = ctx.start();
    let router = http::create_router(ctx.clone());

    info!(name = ctx.name(), "pgperf listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    ctx.stop(handles).await;
    Ok(())
}

async fn dashboard(config: config::AppConfig, text: bool) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    if let Err(err) = ctx.indexes.analyze(&ctx.shutdown_token()).await {
        warn!(error = %err, "index analysis failed; dashboard will omit it");
    }
    let report = ctx.dashboard.report().await;
    if text {
        println!("{}", report.to_text());
    } else {
        println!("{}", report.to_json()?);
    }
    ctx.stop(Vec::new()).await;
    Ok(())
}

async fn index_script(config: config::AppConfig, apply: bool) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let cancel = ctx.shutdown_token();
    let analysis = ctx.indexes.analyze(&cancel).await?;
    println!("{}", analysis.optimization_script());

    if apply {
        let outcome = ctx.indexes.optimize_concurrently(&analysis, &cancel).await?;
        info!(
            applied = outcome.applied.len(),
            failed = outcome.failed.len(),
            "index optimization finished"
        );
    }
    ctx.stop(Vec::new()).await;
    Ok(())
}

async fn load_test(config: config::AppConfig, load: LoadTestConfig) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let handles = ctx.start();
    // `execute` records each statement with the query monitor itself.
    let tester = PerformanceTester::without_monitor();

    let runner = ctx.clone();
    let statement: Arc<str> = Arc::from(load.statement.as_str());
    let report = tester
        .run(
            &load,
            move |_| {
                let runner = runner.clone();
                let statement = Arc::clone(&statement);
                async move { runner.execute(&statement).await.map(|_| ()) }
            },
            &ctx.shutdown_token(),
        )
        .await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    ctx.stop(handles).await;
    Ok(())
}

async fn migrate(
    config: config::AppConfig,
    change: MigrationCommand,
    execute: bool,
) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let planner = &ctx.migrations;

    let plan: OptimizedMigration = match &change {
        MigrationCommand::AddColumn {
            table,
            column,
            data_type,
            not_null,
            default,
        } => {
            planner
                .optimize_add_column(table, column, data_type, !not_null, default.as_deref())
                .await
        }
        MigrationCommand::AddIndex {
            table,
            columns,
            unique,
        } => {
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            planner.optimize_add_index(table, &columns, *unique).await
        }
        MigrationCommand::DropColumn { table, column } => {
            planner.optimize_drop_column(table, column).await
        }
        MigrationCommand::ChangeType {
            table,
            column,
            from,
            to,
        } => {
            planner
                .optimize_change_column_type(table, column, from, to)
                .await
        }
    };

    println!("{}", plan.to_text());

    if execute {
        if plan.timing.requires_maintenance_window {
            warn!(migration = %plan.name, "plan requires a maintenance window");
        }
        let result = planner
            .execute(&plan, ctx.catalog.as_ref(), &ctx.shutdown_token())
            .await;
        ctx.stop(Vec::new()).await;
        match result {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(err) => bail!("migration {} failed: {err}", plan.name),
        }
    } else {
        ctx.stop(Vec::new()).await;
    }
    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pgperf=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
