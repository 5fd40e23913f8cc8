//! Dropzone upload server binary.
//!
//! Accepts `multipart/form-data` uploads on `/upload`, authenticates the
//! uploader against a flat credential file, streams each file part to a temp
//! file and renames it into the uploader's directory. The `adduser`,
//! `deluser` and `users` subcommands maintain the credential file.

mod admin;
mod atomic;
mod background;
mod config;
mod credentials;
mod error;
mod http;
mod locking;
mod logging;
mod password;
mod paths;
mod session;
mod upload;

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::background::spawn_background_tasks;
use crate::config::{Cli, Command, ServeArgs};
use crate::credentials::CredentialStore;
use crate::http::{Shared, build_router};
use crate::locking::LockManager;
use crate::paths::PathPolicy;
use crate::upload::UploadConfig;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level());

    let store = CredentialStore::new(
        cli.passwd_file.clone(),
        Duration::from_secs(cli.reload_ttl_secs),
    );

    let outcome = match cli.command {
        Command::Serve(args) => return serve(args, store).await,
        Command::Adduser(args) => {
            admin::add_user(&store, &args.username, args.password, &args.prefix).await
        }
        Command::Deluser(args) => admin::delete_user(&store, &args.username).await,
        Command::Users => admin::list_users(&store).await.map(|lines| {
            for line in lines {
                println!("{line}");
            }
        }),
    };

    if let Err(err) = outcome {
        eprintln!("{err}");
        std::process::exit(1);
    }
    Ok(())
}

/// Starts the upload server and blocks until shutdown.
async fn serve(args: ServeArgs, store: CredentialStore) -> Result<(), std::io::Error> {
    if !tokio::fs::try_exists(store.path()).await.unwrap_or(false) {
        warn!(path = ?store.path(), "credential file missing; authenticated uploads will fail");
    }

    let policy = Arc::new(PathPolicy {
        upload_base_dir: args.upload_base_dir.clone(),
        anonymous_dir: args.anonymous_dir.clone(),
        allow_parent_prefix: args.allow_parent_prefix,
    });
    let upload_config = Arc::new(UploadConfig {
        max_file_size: args.max_file_size,
        overwrite: args.overwrite,
        auto_create_dirs: args.auto_create_user_dirs,
        tmp_suffix: args.tmp_suffix.clone(),
        temp_ttl: Duration::from_secs(args.temp_ttl_secs),
    });
    let locks = Arc::new(LockManager::new());

    let mut sweep_roots = vec![args.upload_base_dir.clone()];
    sweep_roots.extend(args.anonymous_dir.clone());
    spawn_background_tasks(sweep_roots, upload_config.clone(), locks.clone());

    let app = build_router(
        Shared {
            store: Arc::new(store),
            policy,
            upload: upload_config,
            locks,
        },
        args.static_dir.as_deref(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        "Starting upload server at {} (base dir {})",
        addr,
        args.upload_base_dir.display()
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
