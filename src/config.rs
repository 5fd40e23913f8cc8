//! CLI arguments and server configuration defaults.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024 * 1024;
pub const DEFAULT_TMP_SUFFIX: &str = ".~tmp";
pub const DEFAULT_PASSWD_FILE: &str = "passwd";
pub const DEFAULT_RELOAD_TTL_SECS: u64 = 10;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const TEMP_CLEAN_INTERVAL_SECS: u64 = 900;
pub const FINALIZE_LOCK_TIMEOUT_SECS: u64 = 30;

/// Top-level command line.
#[derive(Parser)]
#[command(
    name = "dropzone-server",
    version,
    about = "Streaming multipart upload server"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "DROPZONE_PASSWD_FILE",
        default_value = DEFAULT_PASSWD_FILE,
        help = "Credential file (login:prefix:flags:hash per line)"
    )]
    pub passwd_file: PathBuf,
    #[arg(
        long,
        global = true,
        env = "DROPZONE_RELOAD_TTL_SECS",
        default_value_t = DEFAULT_RELOAD_TTL_SECS,
        help = "Minimum seconds between credential file staleness checks"
    )]
    pub reload_ttl_secs: u64,
    #[arg(short, long, global = true, help = "Log at info level")]
    pub verbose: bool,
    #[arg(short, long, global = true, help = "Log at debug level")]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// 根据 `-v` / `-d` 选择默认日志级别。
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the upload server.
    Serve(ServeArgs),
    /// Create or update a user with write permission.
    Adduser(AddUserArgs),
    /// Remove a user.
    Deluser(DelUserArgs),
    /// List users without their password hashes.
    Users,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(
        short = 'b',
        long,
        env = "DROPZONE_BIND",
        default_value = DEFAULT_HOST,
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DROPZONE_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'u',
        long,
        env = "DROPZONE_UPLOAD_BASE_DIR",
        help = "Directory user prefixes are resolved against"
    )]
    pub upload_base_dir: PathBuf,
    #[arg(
        long,
        env = "DROPZONE_ANONYMOUS_DIR",
        help = "Destination for uploads without a Username header (disabled when unset)"
    )]
    pub anonymous_dir: Option<PathBuf>,
    #[arg(
        long,
        env = "DROPZONE_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max accepted request size in bytes (0 to disable)"
    )]
    pub max_file_size: u64,
    #[arg(long, env = "DROPZONE_OVERWRITE", help = "Replace existing files")]
    pub overwrite: bool,
    #[arg(
        long,
        env = "DROPZONE_AUTO_CREATE_USER_DIRS",
        help = "Create missing user upload directories"
    )]
    pub auto_create_user_dirs: bool,
    #[arg(
        long,
        env = "DROPZONE_ALLOW_PARENT_PREFIX",
        help = "Honour user prefixes starting with `../` (taken relative to the working directory, not the base directory)"
    )]
    pub allow_parent_prefix: bool,
    #[arg(
        long,
        env = "DROPZONE_TMP_SUFFIX",
        default_value = DEFAULT_TMP_SUFFIX,
        help = "Suffix of in-progress upload files"
    )]
    pub tmp_suffix: String,
    #[arg(
        long,
        env = "DROPZONE_STATIC_DIR",
        help = "Directory with the upload form served for other paths"
    )]
    pub static_dir: Option<PathBuf>,
    #[arg(long, env = "DROPZONE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DROPZONE_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Age after which orphaned temp files are removed (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
}

#[derive(Args)]
pub struct AddUserArgs {
    #[arg(long, help = "Login name")]
    pub username: String,
    #[arg(long, env = "DROPZONE_PASSWORD", help = "Password (prompted when omitted)")]
    pub password: Option<String>,
    #[arg(long, default_value = "", help = "Upload directory prefix")]
    pub prefix: String,
}

#[derive(Args, Debug)]
pub struct DelUserArgs {
    #[arg(long, help = "Login name")]
    pub username: String,
}
