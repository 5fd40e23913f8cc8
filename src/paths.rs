//! 根据身份与配置计算上传目标目录。

use axum::http::HeaderMap;
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

use crate::credentials::{CredentialStore, normalize_login};
use crate::error::ApiError;

pub const USERNAME_HEADER: &str = "username";
pub const PASSWORD_HEADER: &str = "password";
const PARENT_DIR_MARKER: &str = "..";

#[derive(Debug, Clone)]
pub struct PathPolicy {
    pub upload_base_dir: PathBuf,
    /// Used verbatim; never joined under `upload_base_dir`.
    pub anonymous_dir: Option<PathBuf>,
    /// Operator opt-in for prefixes starting with `..`, which bypass the base dir.
    pub allow_parent_prefix: bool,
}

/// 请求头中携带的身份信息。
#[derive(Clone)]
pub struct Credentials {
    pub login: String,
    pub password: Option<String>,
}

impl Credentials {
    /// 从 `Username` / `Password` 请求头提取身份；缺失或空白的用户名视为匿名。
    ///
    /// A `Username` header that is present but not valid UTF-8 still counts as
    /// a presented identity and fails authentication.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, ApiError> {
        let Some(raw_login) = headers.get(USERNAME_HEADER) else {
            return Ok(None);
        };
        let login = raw_login.to_str().map(normalize_login).map_err(|_| {
            warn!("upload username header is not valid UTF-8");
            invalid_credentials()
        })?;
        if login.is_empty() {
            return Ok(None);
        }
        let password = headers
            .get(PASSWORD_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(Some(Self { login, password }))
    }
}

fn invalid_credentials() -> ApiError {
    ApiError::Forbidden("Invalid username or password.".into())
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PathPolicy {
    /// 将用户前缀映射为目标目录，不访问文件系统。
    pub fn destination_for_prefix(&self, prefix: &str) -> Result<PathBuf, ApiError> {
        if prefix.starts_with(PARENT_DIR_MARKER) {
            if !self.allow_parent_prefix {
                warn!(prefix, "parent-directory prefix refused; not enabled by operator");
                return Err(ApiError::Internal(
                    "Server misconfiguration - upload prefix escapes the base directory.".into(),
                ));
            }
            return Ok(PathBuf::from(prefix));
        }
        if prefix.is_empty() {
            return Ok(self.upload_base_dir.clone());
        }
        Ok(self.upload_base_dir.join(prefix))
    }
}

/// 解析上传目标目录：匿名用户使用匿名目录，登录用户需通过口令校验。
pub async fn resolve_destination(
    identity: Option<&Credentials>,
    store: &CredentialStore,
    policy: &PathPolicy,
) -> Result<PathBuf, ApiError> {
    let Some(identity) = identity else {
        return policy.anonymous_dir.clone().ok_or_else(|| {
            ApiError::Unauthorized("Unauthorized - anonymous uploads are not allowed.".into())
        });
    };

    let password = identity.password.as_deref().unwrap_or_default();
    if !store.check_password(&identity.login, password).await? {
        warn!(login = %identity.login, "upload authentication failed");
        return Err(invalid_credentials());
    }
    let user = store
        .get_user(&identity.login)
        .await?
        .ok_or_else(invalid_credentials)?;

    policy.destination_for_prefix(&user.prefix)
}
