use clap::Parser;
use miette::{IntoDiagnostic, Result};
use migration::{Migrator, MigratorTrait};
use tollgate::{jobs, jwks, settings, storage, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "tollgate",
    version,
    about = "OAuth2 token service with license-bound device activation"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(
        issuer = %settings.issuer(),
        database = settings.database.backend(),
        "Loaded configuration"
    );

    // init storage (database) and bring the schema up to date
    let db = storage::init(&settings.database).await?;
    Migrator::up(&db, None).await.into_diagnostic()?;

    // init jwks (generate if missing)
    let jwks_mgr = jwks::JwksManager::new(settings.keys.clone()).await?;

    // background maintenance
    let _scheduler = if settings.jobs.enabled {
        Some(jobs::init_scheduler(db.clone(), &settings.jobs).await?)
    } else {
        tracing::info!("Background jobs are disabled");
        None
    };

    // start web server
    web::serve(web::AppState::new(settings, db, jwks_mgr)).await?;
    Ok(())
}
