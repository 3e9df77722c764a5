//! User directory.
//!
//! Enumerates the users eligible for automated trading and carries the
//! settings mutation point used by the external settings layer. The
//! engine reads a snapshot at cycle start; updates only take effect for
//! cycles that start afterwards.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::types::{RiskLevel, UserTradeProfile};

/// Partial settings update. `None` leaves a field untouched;
/// `custom_prompt: Some(None)` clears the prompt.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub auto_trade_enabled: Option<bool>,
    pub risk_level: Option<RiskLevel>,
    pub max_leverage: Option<u32>,
    pub custom_prompt: Option<Option<String>>,
}

/// Abstraction over the profile store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Snapshot of users enabled for automated trading with both
    /// credential blobs present.
    async fn eligible_profiles(&self) -> Result<Vec<UserTradeProfile>>;

    /// Apply a settings patch for one user.
    async fn update_settings(&self, user_id: i64, update: ProfileUpdate) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteUserDirectory {
    pool: SqlitePool,
}

impl SqliteUserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the users table if missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 email TEXT NOT NULL UNIQUE,
                 risk_level TEXT NOT NULL DEFAULT 'medium',
                 max_leverage INTEGER NOT NULL DEFAULT 10,
                 custom_prompt TEXT,
                 auto_trade_enabled INTEGER NOT NULL DEFAULT 0,
                 encrypted_api_key TEXT,
                 encrypted_api_secret TEXT,
                 updated_at TEXT
             )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;
        Ok(())
    }

    /// Insert a user and return the assigned id.
    pub async fn insert_user(&self, profile: &UserTradeProfile) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO users
                 (email, risk_level, max_leverage, custom_prompt,
                  auto_trade_enabled, encrypted_api_key, encrypted_api_secret,
                  updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.email)
        .bind(profile.risk_level.as_str())
        .bind(profile.max_leverage as i64)
        .bind(&profile.custom_prompt)
        .bind(profile.auto_trade_enabled)
        .bind(&profile.encrypted_api_key)
        .bind(&profile.encrypted_api_secret)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        Ok(result.last_insert_rowid())
    }

    /// Credential rotation (part of the settings surface).
    pub async fn set_credentials(
        &self,
        user_id: i64,
        encrypted_api_key: &str,
        encrypted_api_secret: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users
             SET encrypted_api_key = ?, encrypted_api_secret = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(encrypted_api_key)
        .bind(encrypted_api_secret)
        .bind(chrono::Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update credentials")?;
        Ok(())
    }

    pub async fn get_profile(&self, user_id: i64) -> Result<Option<UserTradeProfile>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;

        row.map(|r| row_to_profile(&r)).transpose()
    }
}

fn row_to_profile(row: &SqliteRow) -> Result<UserTradeProfile> {
    let risk: String = row.try_get("risk_level")?;
    Ok(UserTradeProfile {
        user_id: row.try_get("id")?,
        email: row.try_get("email")?,
        risk_level: risk.parse().unwrap_or(RiskLevel::Medium),
        max_leverage: row.try_get::<i64, _>("max_leverage")?.max(1) as u32,
        custom_prompt: row.try_get("custom_prompt")?,
        auto_trade_enabled: row.try_get("auto_trade_enabled")?,
        encrypted_api_key: row
            .try_get::<Option<String>, _>("encrypted_api_key")?
            .unwrap_or_default(),
        encrypted_api_secret: row
            .try_get::<Option<String>, _>("encrypted_api_secret")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn eligible_profiles(&self) -> Result<Vec<UserTradeProfile>> {
        let rows = sqlx::query(
            "SELECT * FROM users
             WHERE auto_trade_enabled = 1
               AND encrypted_api_key IS NOT NULL
               AND encrypted_api_secret IS NOT NULL
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query eligible users")?;

        let profiles = rows
            .iter()
            .map(row_to_profile)
            .collect::<Result<Vec<_>>>()?;

        debug!(count = profiles.len(), "Eligible users loaded");
        Ok(profiles)
    }

    async fn update_settings(&self, user_id: i64, update: ProfileUpdate) -> Result<()> {
        let Some(current) = self.get_profile(user_id).await? else {
            anyhow::bail!("user {user_id} not found");
        };

        let enabled = update.auto_trade_enabled.unwrap_or(current.auto_trade_enabled);
        let risk_level = update.risk_level.unwrap_or(current.risk_level);
        let max_leverage = update.max_leverage.unwrap_or(current.max_leverage);
        let custom_prompt = match update.custom_prompt {
            Some(p) => p,
            None => current.custom_prompt,
        };

        sqlx::query(
            "UPDATE users
             SET auto_trade_enabled = ?, risk_level = ?, max_leverage = ?,
                 custom_prompt = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(enabled)
        .bind(risk_level.as_str())
        .bind(max_leverage as i64)
        .bind(&custom_prompt)
        .bind(chrono::Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update user settings")?;

        info!(user_id, enabled, risk = %risk_level, "User settings updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn directory() -> SqliteUserDirectory {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let dir = SqliteUserDirectory::new(pool);
        dir.migrate().await.unwrap();
        dir
    }

    fn enabled_profile(email: &str) -> UserTradeProfile {
        UserTradeProfile {
            user_id: 0,
            email: email.to_string(),
            risk_level: RiskLevel::Medium,
            max_leverage: 10,
            custom_prompt: None,
            auto_trade_enabled: true,
            encrypted_api_key: "enc-key".to_string(),
            encrypted_api_secret: "enc-secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let dir = directory().await;
        let id = dir.insert_user(&enabled_profile("a@example.com")).await.unwrap();

        let profile = dir.get_profile(id).await.unwrap().unwrap();
        assert_eq!(profile.email, "a@example.com");
        assert_eq!(profile.max_leverage, 10);
        assert!(profile.auto_trade_enabled);
    }

    #[tokio::test]
    async fn test_eligible_excludes_disabled() {
        let dir = directory().await;
        dir.insert_user(&enabled_profile("on@example.com")).await.unwrap();

        let mut off = enabled_profile("off@example.com");
        off.auto_trade_enabled = false;
        dir.insert_user(&off).await.unwrap();

        let eligible = dir.eligible_profiles().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].email, "on@example.com");
    }

    #[tokio::test]
    async fn test_update_settings_partial() {
        let dir = directory().await;
        let id = dir.insert_user(&enabled_profile("u@example.com")).await.unwrap();

        dir.update_settings(
            id,
            ProfileUpdate {
                max_leverage: Some(3),
                custom_prompt: Some(Some("be careful".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let profile = dir.get_profile(id).await.unwrap().unwrap();
        assert_eq!(profile.max_leverage, 3);
        assert_eq!(profile.custom_prompt.as_deref(), Some("be careful"));
        // Untouched fields survive.
        assert!(profile.auto_trade_enabled);
        assert_eq!(profile.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_update_settings_clears_prompt() {
        let dir = directory().await;
        let mut p = enabled_profile("u@example.com");
        p.custom_prompt = Some("old".to_string());
        let id = dir.insert_user(&p).await.unwrap();

        dir.update_settings(
            id,
            ProfileUpdate {
                custom_prompt: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let profile = dir.get_profile(id).await.unwrap().unwrap();
        assert_eq!(profile.custom_prompt, None);
    }

    #[tokio::test]
    async fn test_update_unknown_user_errors() {
        let dir = directory().await;
        assert!(dir.update_settings(999, ProfileUpdate::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_credential_rotation() {
        let dir = directory().await;
        let id = dir.insert_user(&enabled_profile("u@example.com")).await.unwrap();

        dir.set_credentials(id, "new-key", "new-secret").await.unwrap();
        let profile = dir.get_profile(id).await.unwrap().unwrap();
        assert_eq!(profile.encrypted_api_key, "new-key");
        assert_eq!(profile.encrypted_api_secret, "new-secret");
    }
}
