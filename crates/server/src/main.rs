use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tabs_server::{AppState, Db, auth, router};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("migrate") {
        match run_migrations() {
            Ok(()) => {
                println!("migrations applied");
                return;
            }
            Err(err) => {
                eprintln!("tabs-server: migrate failed: {}", err);
                std::process::exit(1);
            }
        }
    }

    if let Err(err) = run().await {
        eprintln!("tabs-server: {}", err);
        std::process::exit(err.exit_code);
    }
}

struct StartupError {
    message: String,
    exit_code: i32,
}

impl StartupError {
    fn usage(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 2,
        }
    }

    fn runtime(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 1,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_bool(name: &str) -> bool {
    matches!(
        env(name).trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn database_path() -> Result<PathBuf, StartupError> {
    let raw = env("DATABASE_URL");
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StartupError::usage("DATABASE_URL is required"));
    }
    let path = raw
        .strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(raw);
    Ok(PathBuf::from(path))
}

fn run_migrations() -> Result<(), StartupError> {
    let db_path = database_path()?;
    let mut db =
        Db::open(&db_path).map_err(|err| StartupError::runtime(err.to_string()))?;
    db.migrate()
        .map_err(|err| StartupError::runtime(err.to_string()))
}

async fn run() -> Result<(), StartupError> {
    let log_level = env("LOG_LEVEL");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if log_level.is_empty() {
            "info".to_string()
        } else {
            log_level
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db_path = database_path()?;

    {
        let mut db =
            Db::open(&db_path).map_err(|err| StartupError::runtime(err.to_string()))?;
        if env_bool("MIGRATE_ON_START") {
            db.migrate()
                .map_err(|err| StartupError::runtime(err.to_string()))?;
        }
        db.ping()
            .map_err(|err| StartupError::runtime(format!("database connection failed: {}", err)))?;
    }

    let port: u16 = match env("PORT").trim() {
        "" => 8080,
        raw => raw
            .parse()
            .map_err(|_| StartupError::usage("PORT must be a number"))?,
    };
    let base_url = match env("BASE_URL").trim() {
        "" => format!("http://localhost:{}", port),
        raw => raw.to_string(),
    };

    let auth = auth::from_env(
        &env("AUTH_MODE"),
        &env("AUTH_HEADER_USER"),
        &env("IAP_AUDIENCE"),
        &env("IAP_ISSUER"),
        &env("IAP_JWKS_URL"),
        None,
    )
    .map_err(StartupError::usage)?;

    let state = AppState::new(db_path, base_url, auth);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| StartupError::runtime(format!("bind {}: {}", addr, err)))?;
    info!(addr, version = env!("CARGO_PKG_VERSION"), "tabs-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|err| StartupError::runtime(err.to_string()))
}
