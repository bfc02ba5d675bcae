use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use docsmith::catalog::InjectorCatalog;
use docsmith::config::Settings;
use docsmith::engine::Engine;
use docsmith::injectable::{DataType, FormatSpec, InjectableValue};
use docsmith::registry::InjectorEntry;

#[derive(Parser)]
#[command(name = "docsmith")]
#[command(about = "Multi-tenant document template and PDF rendering service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Use the in-memory store; pairs with auth dummy mode
        #[arg(long)]
        ephemeral: bool,
    },
    /// Validate a configuration file
    Validate,
    /// Check that the typesetter binary is usable
    Probe,
    /// Parse and lint an injector catalog file
    Catalog {
        /// Path to the catalog file
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&settings);

    let result = match cli.command.unwrap_or(Commands::Serve { ephemeral: false }) {
        Commands::Serve { ephemeral } => serve(settings, ephemeral).await,
        Commands::Validate => {
            println!("configuration ok");
            Ok(())
        }
        Commands::Probe => probe(&settings),
        Commands::Catalog { file } => lint_catalog(&settings, &file),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.logging.level.clone()));
    if settings.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// The injectors every deployment ships with. Integrators extend this
/// set through the engine builder.
fn builtin_injectors() -> Vec<InjectorEntry> {
    vec![
        InjectorEntry::internal("date_now", DataType::Time, |_| {
            Box::pin(async { Ok(InjectableValue::Time(chrono::Utc::now())) })
        })
        .with_formats(FormatSpec {
            default: "%Y-%m-%d".to_string(),
            options: vec![
                "%Y-%m-%d".to_string(),
                "%d.%m.%Y".to_string(),
                "%B %e, %Y".to_string(),
            ],
        })
        .with_label("en", "Current date")
        .with_group("system"),
        InjectorEntry::internal("tenant_code", DataType::Text, |ctx| {
            Box::pin(async move {
                Ok(InjectableValue::Text(
                    ctx.tenant_code().unwrap_or_default().to_string(),
                ))
            })
        })
        .with_label("en", "Tenant code")
        .with_group("system"),
        InjectorEntry::internal("workspace_code", DataType::Text, |ctx| {
            Box::pin(async move {
                Ok(InjectableValue::Text(
                    ctx.workspace_code().unwrap_or_default().to_string(),
                ))
            })
        })
        .with_label("en", "Workspace code")
        .with_group("system"),
        InjectorEntry::internal("user_email", DataType::Text, |ctx| {
            Box::pin(async move {
                Ok(InjectableValue::Text(
                    ctx.identity().map(|i| i.email.clone()).unwrap_or_default(),
                ))
            })
        })
        .with_label("en", "Requesting user email")
        .with_group("system"),
    ]
}

async fn serve(settings: Settings, ephemeral: bool) -> docsmith::Result<()> {
    let host = settings.server.host.clone();
    let port = settings.server.port;

    let mut builder = if ephemeral {
        Engine::ephemeral(settings)
    } else {
        Engine::builder(settings)
    };
    for entry in builtin_injectors() {
        builder = builder.register_injector(entry)?;
    }
    let engine = Arc::new(builder.build().await?);
    engine.start_workers();

    let app = docsmith::http::router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    info!(%host, port, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn probe(settings: &Settings) -> docsmith::Result<()> {
    let typesetter = docsmith::render::typesetter::Typesetter::new(
        settings.typesetter.bin_path.clone(),
        settings.typesetter.font_dirs.clone(),
    );
    let version = typesetter.probe()?;
    println!("typesetter ok: {version}");
    Ok(())
}

fn lint_catalog(_settings: &Settings, file: &Path) -> docsmith::Result<()> {
    let catalog = InjectorCatalog::load(file)?;
    let mut builder = docsmith::registry::InjectorRegistry::builder();
    for entry in builtin_injectors() {
        builder.register(entry)?;
    }
    let registry = builder.build();
    let findings = catalog.lint(&registry);
    if findings.is_empty() {
        println!(
            "catalog ok: {} group(s), {} injector entr(ies)",
            catalog.groups.len(),
            catalog.injectors.len()
        );
    } else {
        for finding in &findings {
            println!("warning: {finding}");
        }
    }
    Ok(())
}
