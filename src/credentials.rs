//! 用户凭据库：带 TTL 的缓存、按 mtime 重新加载与原子落盘。
//!
//! The backing file is plain text, one user per line:
//! `login:prefix:permission_flags:password_hash`. The hash is the remainder
//! of the line and may itself contain `:`. Lines starting with `#` are
//! comments.
//!
//! Reloads are driven by mtime, so edits landing within the same timestamp
//! granularity as the previous load can stay invisible until the file is
//! touched again. The file is edited by humans, so that window is accepted.

use axum::http::StatusCode;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::password::{PasswordError, PasswordHasher};

pub const PASSWD_HEADER: &str = "# username:upload_dir_prefix:permission_flags:password_hash";
pub const MIN_PASSWORD_LENGTH: usize = 6;
const DUMP_BUFFER_SIZE: usize = 8 * 1024;

static LOGIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*$").expect("login pattern"));
static PREFIX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/|(\.\./)+)?[a-z][a-z0-9]*(/[a-z][a-z0-9]*)*$").expect("prefix pattern")
});

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid login name '{0}'")]
    InvalidLogin(String),
    #[error("Invalid prefix '{0}'")]
    InvalidPrefix(String),
    #[error("{0}")]
    PasswordPolicy(String),
    #[error("Cannot delete, user '{0}' does not exist.")]
    UnknownUser(String),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CredentialError {
    /// 对应的 HTTP 风格状态码。
    pub fn status(&self) -> StatusCode {
        match self {
            CredentialError::InvalidLogin(_) | CredentialError::InvalidPrefix(_) => {
                StatusCode::BAD_REQUEST
            }
            CredentialError::PasswordPolicy(_) => StatusCode::FORBIDDEN,
            CredentialError::UnknownUser(_) => StatusCode::NOT_FOUND,
            CredentialError::Password(_) | CredentialError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    Write,
}

impl Permission {
    pub fn from_flag(flag: char) -> Option<Self> {
        match flag {
            'W' => Some(Permission::Write),
            _ => None,
        }
    }

    pub fn flag(self) -> char {
        match self {
            Permission::Write => 'W',
        }
    }
}

/// 权限标记集合，只包含可识别的标记。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions(BTreeSet<Permission>);

impl Permissions {
    /// 解析标记字符串，忽略无法识别的字符。
    pub fn parse_lossy(input: &str) -> Self {
        Self(input.chars().filter_map(Permission::from_flag).collect())
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for permission in &self.0 {
            write!(f, "{}", permission.flag())?;
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct User {
    pub login: String,
    pub prefix: String,
    pub permissions: Permissions,
    /// PHC string; empty means the account is disabled.
    pub password_hash: String,
}

impl User {
    pub fn is_disabled(&self) -> bool {
        self.password_hash.is_empty()
    }

    fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.login, self.prefix, self.permissions, self.password_hash
        )
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("login", &self.login)
            .field("prefix", &self.prefix)
            .field("permissions", &self.permissions)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// 规范化登录名：去除空白并转为小写。
pub fn normalize_login(login: &str) -> String {
    login.trim().to_lowercase()
}

pub fn is_valid_login(login: &str) -> bool {
    LOGIN_PATTERN.is_match(login)
}

/// 空前缀合法；非空前缀的每一段都以字母开头，且不能以分隔符结尾。
///
/// A leading `/` or a run of leading `../` segments is allowed; whether a
/// `..` prefix is honoured is decided by the server at upload time.
pub fn is_valid_prefix(prefix: &str) -> bool {
    prefix.is_empty() || PREFIX_PATTERN.is_match(prefix)
}

#[derive(Default)]
struct Snapshot {
    users: BTreeMap<String, User>,
    loaded_at: Option<Instant>,
    mtime: Option<SystemTime>,
}

/// Cached view of the credential file.
///
/// Reads re-parse the file only when the TTL has elapsed since the last load
/// and the file's mtime changed. Writes go to disk first and then replace the
/// cached table.
pub struct CredentialStore {
    path: PathBuf,
    ttl: Duration,
    hasher: PasswordHasher,
    snapshot: RwLock<Snapshot>,
    loads: AtomicU64,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            hasher: PasswordHasher::new(),
            snapshot: RwLock::new(Snapshot::default()),
            loads: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件被完整解析的次数。
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// 凭据文件不存在时创建空文件。
    pub async fn create_if_missing(&self) -> Result<(), CredentialError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(())
    }

    /// 返回全部用户（按登录名排序）。
    pub async fn users(&self) -> Result<Vec<User>, CredentialError> {
        self.refresh().await?;
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.users.values().cloned().collect())
    }

    pub async fn get_user(&self, login: &str) -> Result<Option<User>, CredentialError> {
        self.refresh().await?;
        let login = normalize_login(login);
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.users.get(&login).cloned())
    }

    /// 校验口令；空口令、未知用户与禁用账户都返回 false。
    pub async fn check_password(&self, login: &str, password: &str) -> Result<bool, CredentialError> {
        if password.is_empty() {
            return Ok(false);
        }
        let Some(user) = self.get_user(login).await? else {
            return Ok(false);
        };
        if user.is_disabled() {
            debug!(login = %user.login, "login attempt on disabled account");
            return Ok(false);
        }

        let hasher = self.hasher.clone();
        let password = password.to_owned();
        let hash = user.password_hash;
        let verified = tokio::task::spawn_blocking(move || hasher.verify(&hash, &password))
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        match verified {
            Ok(matched) => Ok(matched),
            Err(err) => {
                warn!(login = %user.login, error = %err, "stored password hash is unusable");
                Ok(false)
            }
        }
    }

    pub async fn get_permissions(&self, login: &str) -> Result<Permissions, CredentialError> {
        Ok(self
            .get_user(login)
            .await?
            .map(|user| user.permissions)
            .unwrap_or_default())
    }

    /// 新增或更新用户并原子落盘。
    ///
    /// An empty `password` keeps the stored hash, so prefix and permission
    /// changes don't require re-entering it. A new user without a password
    /// is stored disabled.
    pub async fn save_user(
        &self,
        login: &str,
        prefix: &str,
        permissions: &str,
        password: &str,
    ) -> Result<(), CredentialError> {
        self.refresh().await?;

        let login = normalize_login(login);
        let prefix = prefix.trim().to_string();
        if !is_valid_login(&login) {
            return Err(CredentialError::InvalidLogin(login));
        }
        if !is_valid_prefix(&prefix) {
            return Err(CredentialError::InvalidPrefix(prefix));
        }
        let permissions = Permissions::parse_lossy(permissions);

        let new_hash = if password.is_empty() {
            None
        } else {
            if password.chars().count() < MIN_PASSWORD_LENGTH {
                return Err(CredentialError::PasswordPolicy(format!(
                    "Minimum password length is {MIN_PASSWORD_LENGTH}."
                )));
            }
            if password == login {
                return Err(CredentialError::PasswordPolicy(
                    "Password and login must not match.".into(),
                ));
            }
            Some(self.hash_password(password).await?)
        };

        let mut snapshot = self.snapshot.write().await;
        let password_hash = match new_hash {
            Some(hash) => hash,
            None => snapshot
                .users
                .get(&login)
                .map(|user| user.password_hash.clone())
                .unwrap_or_default(),
        };
        let mut users = snapshot.users.clone();
        users.insert(
            login.clone(),
            User {
                login: login.clone(),
                prefix,
                permissions,
                password_hash,
            },
        );

        info!(login = %login, "saving user");
        let mtime = self.dump(&users).await?;
        snapshot.users = users;
        snapshot.mtime = Some(mtime);
        Ok(())
    }

    /// 删除用户并原子落盘。
    pub async fn delete_user(&self, login: &str) -> Result<(), CredentialError> {
        self.refresh().await?;

        let login = normalize_login(login);
        if !is_valid_login(&login) {
            return Err(CredentialError::InvalidLogin(login));
        }

        let mut snapshot = self.snapshot.write().await;
        if !snapshot.users.contains_key(&login) {
            return Err(CredentialError::UnknownUser(login));
        }
        let mut users = snapshot.users.clone();
        users.remove(&login);

        info!(login = %login, "deleting user");
        let mtime = self.dump(&users).await?;
        snapshot.users = users;
        snapshot.mtime = Some(mtime);
        Ok(())
    }

    async fn hash_password(&self, password: &str) -> Result<String, CredentialError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|err| io::Error::other(err.to_string()))??;
        Ok(hash)
    }

    async fn refresh(&self) -> Result<(), CredentialError> {
        {
            let snapshot = self.snapshot.read().await;
            if !self.is_stale(&snapshot) {
                return Ok(());
            }
        }

        let mut snapshot = self.snapshot.write().await;
        if !self.is_stale(&snapshot) {
            return Ok(());
        }
        let mtime = fs::metadata(&self.path).await?.modified()?;
        if snapshot.mtime == Some(mtime) {
            return Ok(());
        }

        let users = self.load_users().await?;
        snapshot.users = users;
        snapshot.mtime = Some(mtime);
        snapshot.loaded_at = Some(Instant::now());
        Ok(())
    }

    fn is_stale(&self, snapshot: &Snapshot) -> bool {
        match snapshot.loaded_at {
            Some(loaded_at) => loaded_at.elapsed() > self.ttl,
            None => true,
        }
    }

    async fn load_users(&self) -> Result<BTreeMap<String, User>, CredentialError> {
        info!(path = ?self.path, "reloading users");
        self.loads.fetch_add(1, Ordering::Relaxed);

        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut users = BTreeMap::new();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if let Some(user) = parse_line(&line, line_no) {
                users.insert(user.login.clone(), user);
            }
        }
        debug!(count = users.len(), "users loaded");
        Ok(users)
    }

    /// 写入 `.part` 临时文件，轮换 `.bak` 后替换正式文件，返回新的 mtime。
    async fn dump(&self, users: &BTreeMap<String, User>) -> Result<SystemTime, CredentialError> {
        let temp_path = sibling_path(&self.path, ".part");
        let backup_path = sibling_path(&self.path, ".bak");

        let mut file =
            AtomicFile::create(temp_path, self.path.clone(), DUMP_BUFFER_SIZE).await?;
        file.write_all(format!("{PASSWD_HEADER}\n").as_bytes())
            .await?;
        for user in users.values() {
            file.write_all(format!("{}\n", user.to_line()).as_bytes())
                .await?;
        }
        file.sync().await?;

        match fs::remove_file(&backup_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        // Between these two renames the live file is missing; the backup holds
        // the previous generation for manual recovery.
        fs::rename(&self.path, &backup_path).await?;
        file.persist().await?;

        Ok(fs::metadata(&self.path).await?.modified()?)
    }
}

fn parse_line(line: &str, line_no: usize) -> Option<User> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.splitn(4, ':').collect();
    let [login, prefix, flags, hash] = fields[..] else {
        warn!(line = line_no, "malformed credential line");
        return None;
    };
    let login = normalize_login(login);
    let prefix = prefix.trim();

    let login_ok = is_valid_login(&login);
    let prefix_ok = is_valid_prefix(prefix);
    if !login_ok {
        warn!(line = line_no, login = %login, "invalid login name");
    }
    if !prefix_ok {
        warn!(line = line_no, prefix = %prefix, "invalid prefix");
    }
    if !(login_ok && prefix_ok) {
        return None;
    }

    let permissions = Permissions::parse_lossy(flags);
    if flags.chars().any(|flag| Permission::from_flag(flag).is_none()) {
        warn!(line = line_no, flags = %flags, "ignoring unknown permission flags");
    }

    Some(User {
        login,
        prefix: prefix.to_string(),
        permissions,
        password_hash: hash.to_string(),
    })
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(10);

    fn store_with(contents: &str) -> (tempfile::TempDir, CredentialStore) {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("passwd");
        std::fs::write(&path, contents).expect("seed passwd");
        let store = CredentialStore::new(path, TTL);
        (temp, store)
    }

    fn touch(path: &Path, contents: &str, secs: u64) {
        std::fs::write(path, contents).expect("rewrite passwd");
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open passwd");
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .expect("set mtime");
    }

    #[tokio::test]
    async fn save_then_lookup_round_trips() {
        let (_temp, store) = store_with("");
        store
            .save_user("alice", "team1/photos", "W", "secret1")
            .await
            .expect("save alice");

        let user = store.get_user("alice").await.expect("load").expect("alice");
        assert_eq!(user.login, "alice");
        assert_eq!(user.prefix, "team1/photos");
        assert!(store.check_password("alice", "secret1").await.expect("check"));
        assert!(!store.check_password("alice", "wrong").await.expect("check"));

        let permissions = store.get_permissions("alice").await.expect("perms");
        assert!(permissions.contains(Permission::Write));
        assert_eq!(permissions.to_string(), "W");
    }

    #[tokio::test]
    async fn lookup_normalizes_login() {
        let (_temp, store) = store_with("");
        store
            .save_user("  Alice ", "", "W", "secret1")
            .await
            .expect("save");
        assert!(store.get_user("ALICE").await.expect("load").is_some());
        assert!(store.check_password(" alice", "secret1").await.expect("check"));
    }

    #[tokio::test]
    async fn unknown_user_has_no_permissions_or_access() {
        let (_temp, store) = store_with("");
        assert!(store.get_permissions("ghost").await.expect("perms").is_empty());
        assert!(!store.check_password("ghost", "secret1").await.expect("check"));
        assert!(!store.check_password("ghost", "").await.expect("check"));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_is_skipped_within_ttl() {
        let (temp, store) = store_with("alice::W:\n");
        let path = temp.path().join("passwd");

        for _ in 0..5 {
            store.users().await.expect("users");
        }
        assert_eq!(store.load_count(), 1);

        touch(&path, "alice::W:\nbob::W:\n", 1_000);
        assert_eq!(store.users().await.expect("users").len(), 1);
        assert_eq!(store.load_count(), 1);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(store.users().await.expect("users").len(), 2);
        assert_eq!(store.load_count(), 2);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        store.users().await.expect("users");
        assert_eq!(store.load_count(), 2, "unchanged mtime must not re-parse");
    }

    #[tokio::test]
    async fn invalid_logins_are_rejected_without_touching_disk() {
        let (temp, store) = store_with("alice::W:\n");
        let path = temp.path().join("passwd");
        let before = std::fs::read(&path).expect("read");

        for login in ["1abc", "", "ab-c", "a b", "_x", "abc!"] {
            let result = store.save_user(login, "", "W", "secret1").await;
            assert!(
                matches!(result, Err(CredentialError::InvalidLogin(_))),
                "login {login:?} should be rejected"
            );
        }
        assert_eq!(std::fs::read(&path).expect("read"), before);
        assert!(!temp.path().join("passwd.bak").exists());
    }

    #[tokio::test]
    async fn prefixes_ending_with_separator_are_rejected() {
        let (_temp, store) = store_with("");
        for prefix in ["team1/", "a/b/", "/", "../", "..up", "a/../b", "a//b", "9lives"] {
            let result = store.save_user("alice", prefix, "W", "secret1").await;
            assert!(matches!(result, Err(CredentialError::InvalidPrefix(_))));
            assert_eq!(result.unwrap_err().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn absolute_prefix_is_accepted() {
        let (_temp, store) = store_with("");
        store
            .save_user("alice", "/srv/drop", "W", "")
            .await
            .expect("save");
        let user = store.get_user("alice").await.expect("load").expect("alice");
        assert_eq!(user.prefix, "/srv/drop");
    }

    #[tokio::test]
    async fn parent_prefix_survives_reload() {
        let (temp, store) = store_with("carol:../shared/drop:W:\n");
        let carol = store.get_user("carol").await.expect("load").expect("carol");
        assert_eq!(carol.prefix, "../shared/drop");

        store
            .save_user("alice", "../../outside", "W", "")
            .await
            .expect("save");
        let contents = std::fs::read_to_string(temp.path().join("passwd")).expect("read");
        assert!(contents.contains("alice:../../outside:W:"));
    }

    #[tokio::test]
    async fn password_policy_is_enforced() {
        let (_temp, store) = store_with("");
        let short = store.save_user("alice", "", "W", "abc").await;
        assert!(matches!(short, Err(CredentialError::PasswordPolicy(_))));
        let same = store.save_user("alicia", "", "W", "alicia").await;
        assert_eq!(same.unwrap_err().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn dump_is_sorted_and_keeps_backup() {
        let (temp, store) = store_with("# seeded by hand\ncarol::W:\n");
        store.save_user("bob", "b", "W", "").await.expect("save bob");
        store.save_user("alice", "a", "WX", "").await.expect("save alice");

        let path = temp.path().join("passwd");
        let contents = std::fs::read_to_string(&path).expect("read passwd");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![PASSWD_HEADER, "alice:a:W:", "bob:b:W:", "carol::W:"]
        );

        let backup = std::fs::read_to_string(temp.path().join("passwd.bak")).expect("read bak");
        assert_eq!(backup, format!("{PASSWD_HEADER}\nbob:b:W:\ncarol::W:\n"));
        assert!(!temp.path().join("passwd.part").exists());
    }

    #[tokio::test]
    async fn empty_password_keeps_existing_hash() {
        let (_temp, store) = store_with("");
        store
            .save_user("alice", "old", "W", "secret1")
            .await
            .expect("save");
        store.save_user("alice", "new", "", "").await.expect("update");

        let user = store.get_user("alice").await.expect("load").expect("alice");
        assert_eq!(user.prefix, "new");
        assert!(user.permissions.is_empty());
        assert!(store.check_password("alice", "secret1").await.expect("check"));
    }

    #[tokio::test]
    async fn new_user_without_password_is_disabled() {
        let (_temp, store) = store_with("");
        store.save_user("dave", "", "W", "").await.expect("save");
        let user = store.get_user("dave").await.expect("load").expect("dave");
        assert!(user.is_disabled());
        assert!(!store.check_password("dave", "anything").await.expect("check"));
    }

    #[tokio::test]
    async fn delete_user_removes_entry() {
        let (temp, store) = store_with("alice::W:\nbob::W:\n");
        store.delete_user("alice").await.expect("delete");
        assert!(store.get_user("alice").await.expect("load").is_none());

        let contents = std::fs::read_to_string(temp.path().join("passwd")).expect("read");
        assert_eq!(contents, format!("{PASSWD_HEADER}\nbob::W:\n"));

        let missing = store.delete_user("alice").await;
        assert!(matches!(missing, Err(CredentialError::UnknownUser(_))));
        assert_eq!(missing.unwrap_err().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_lines_are_skipped() {
        let contents = "\
# comment
alice:photos:W:$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA

9bad::W:
carol:trailing/:W:
broken line
bob::WQ:x:y:z
";
        let (_temp, store) = store_with(contents);
        let users = store.users().await.expect("users");
        let logins: Vec<&str> = users.iter().map(|user| user.login.as_str()).collect();
        assert_eq!(logins, vec!["alice", "bob"]);

        assert_eq!(
            users[0].password_hash,
            "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"
        );
        assert_eq!(users[1].password_hash, "x:y:z");
        assert_eq!(users[1].permissions.to_string(), "W");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let temp = tempdir().expect("tempdir");
        let store = CredentialStore::new(temp.path().join("absent"), TTL);
        let result = store.get_user("alice").await;
        assert!(matches!(result, Err(CredentialError::Io(_))));

        store.create_if_missing().await.expect("create");
        assert!(store.get_user("alice").await.expect("load").is_none());
    }
}
