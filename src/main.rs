//! tutorchat - operator command line for a tutorchat server

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tutorchat::auth::hash_password;
use tutorchat::client;
use tutorchat::config::Config;
use tutorchat::store::{avatar_url, is_valid_id, NewUser, Role, SqliteStore, Store};

#[derive(Parser)]
#[command(name = "tutorchat")]
#[command(about = "Operator tool for the tutorchat classroom chat server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address, defaults to the configured host and port
    #[arg(short, long, global = true)]
    addr: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an admin account straight into the database
    CreateAdmin {
        id: String,
        name: String,
        password: String,
        /// Database override
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Create a user through a running server
    CreateUser {
        #[arg(long)]
        admin_id: String,
        #[arg(long)]
        admin_password: String,
        id: String,
        name: String,
        password: String,
        /// admin, tutor or student
        role: String,
    },
    /// Create a tutorial through a running server
    CreateTutorial {
        #[arg(long)]
        admin_id: String,
        #[arg(long)]
        admin_password: String,
        id: String,
        name: String,
    },
    /// Assign a user to a tutorial
    Assign {
        #[arg(long)]
        admin_id: String,
        #[arg(long)]
        admin_password: String,
        user_id: String,
        tutorial_id: String,
    },
    /// List the tutorials assigned to a tutor or student
    Tutorials {
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let addr = match cli.addr {
        Some(addr) => addr,
        None => config.addr()?.to_string(),
    };

    match cli.command {
        Commands::CreateAdmin {
            id,
            name,
            password,
            database,
        } => create_admin(&config, database, &id, &name, &password),
        Commands::CreateUser {
            admin_id,
            admin_password,
            id,
            name,
            password,
            role,
        } => {
            client::create_user(
                &addr,
                (&admin_id, &admin_password),
                (&id, &name, &password, &role),
            )
            .await
        }
        Commands::CreateTutorial {
            admin_id,
            admin_password,
            id,
            name,
        } => client::create_tutorial(&addr, (&admin_id, &admin_password), &id, &name).await,
        Commands::Assign {
            admin_id,
            admin_password,
            user_id,
            tutorial_id,
        } => client::assign(&addr, (&admin_id, &admin_password), &user_id, &tutorial_id).await,
        Commands::Tutorials { user, password } => {
            client::list_tutorials(&addr, &user, &password).await
        }
    }
}

/// Bootstraps the first admin; every other account goes through CREATE_USER
fn create_admin(
    config: &Config,
    database: Option<PathBuf>,
    id: &str,
    name: &str,
    password: &str,
) -> Result<()> {
    if !is_valid_id(id) {
        bail!("Invalid user ID: {}", id);
    }
    let path = database.unwrap_or_else(|| config.database_path());
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    let user = store.create_user(NewUser {
        id: id.to_string(),
        name: name.to_string(),
        password_hash: hash_password(password)?,
        role: Role::Admin,
        avatar_url: avatar_url(&config.chat.avatar_style, id),
    })?;

    println!("Admin '{}' created in {}.", user.id, path.display());
    Ok(())
}
