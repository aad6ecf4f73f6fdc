use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    /// Serve the HTTP API.
    Server,

    /// Mint a bearer token without touching the database.
    Jwt {
        uid: i64,
        email: String,

        #[clap(long)]
        admin: bool,

        /// Lifetime in seconds. Defaults to the configured TTL.
        #[clap(long)]
        ttl: Option<f64>,
    },

    /// Create an account. The only way to make an admin.
    UserAdd {
        email: String,
        password: String,

        #[clap(long)]
        admin: bool,
    },

    /// Delete the database file. It is recreated on next start.
    ResetDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    let conf = moodbot::conf::init()?;
    moodbot::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    match cli.cmd {
        Cmd::Server => moodbot::server::run().await,
        Cmd::Jwt {
            uid,
            email,
            admin,
            ttl,
        } => {
            let ttl = Duration::try_from_secs_f64(ttl.unwrap_or(conf.jwt.ttl))?;
            let claims =
                moodbot::auth::Claims::new(uid, &email, admin, ttl, &conf.jwt)?;
            let encoded: String = claims.to_str(&conf.jwt)?;
            println!("{encoded}");
            Ok(())
        }
        Cmd::UserAdd {
            email,
            password,
            admin,
        } => {
            let state = moodbot::server::AppState::new(conf.clone()).await?;
            let user =
                moodbot::auth::user_add(&state.storage, &email, &password, admin)
                    .await
                    .context(format!("Failed to add user: {email:?}"))?;
            println!("{} {} admin={}", user.id, user.email, user.is_admin);
            Ok(())
        }
        Cmd::ResetDb => {
            let db_path = &conf.db_path;
            if !fs::exists(db_path)? {
                println!("No database at {db_path:?}");
                return Ok(());
            }
            fs::remove_file(db_path)
                .context(format!("Failed to delete database: {db_path:?}"))?;
            // WAL side files go with it.
            for suffix in ["-wal", "-shm"] {
                let mut side = db_path.clone().into_os_string();
                side.push(suffix);
                if fs::exists(&side)? {
                    fs::remove_file(&side)?;
                }
            }
            tracing::warn!(?db_path, "Database deleted.");
            println!("Deleted {db_path:?}");
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .support("- Send the report file above to whoever runs this deployment"));
}
