//! 用户管理命令：新增、删除与列出凭据文件中的用户。

use std::io::{self, BufRead, Write};
use tracing::info;

use crate::credentials::{CredentialError, CredentialStore, Permission, normalize_login};

/// 新增或更新具有写权限的用户；未提供口令时从标准输入读取。
pub async fn add_user(
    store: &CredentialStore,
    username: &str,
    password: Option<String>,
    prefix: &str,
) -> Result<(), CredentialError> {
    let password = match password {
        Some(password) => password,
        None => prompt_password(username).await?,
    };
    if password.is_empty() {
        return Err(CredentialError::PasswordPolicy(
            "Password must not be empty.".into(),
        ));
    }

    store.create_if_missing().await?;
    let flags = Permission::Write.flag().to_string();
    store.save_user(username, prefix, &flags, &password).await?;
    info!(login = %normalize_login(username), prefix, "user saved");
    Ok(())
}

pub async fn delete_user(store: &CredentialStore, username: &str) -> Result<(), CredentialError> {
    store.delete_user(username).await?;
    info!(login = %normalize_login(username), "user deleted");
    Ok(())
}

/// 以 `login:prefix:flags` 形式列出用户，不包含口令哈希。
pub async fn list_users(store: &CredentialStore) -> Result<Vec<String>, CredentialError> {
    Ok(store
        .users()
        .await?
        .into_iter()
        .map(|user| {
            let mut line = format!("{}:{}:{}", user.login, user.prefix, user.permissions);
            if user.is_disabled() {
                line.push_str(" (disabled)");
            }
            line
        })
        .collect())
}

async fn prompt_password(username: &str) -> Result<String, CredentialError> {
    let prompt = format!("Password for {}: ", username.trim());
    let line = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut stderr = io::stderr();
        stderr.write_all(prompt.as_bytes())?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))??;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
