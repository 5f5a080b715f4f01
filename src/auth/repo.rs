use crate::auth::repo_types::{Account, NewAccount, NewUser, Session, User};
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

const USER_COLUMNS: &str =
    "id, name, email, password_hash, verified, status, login_method, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write (email or provider account taken).
    #[error("unique constraint violated")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            StoreError::Conflict
        } else {
            StoreError::Other(err.into())
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Persistence seam for users, accounts and sessions.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;

    async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    async fn find_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> anyhow::Result<Option<User>>;

    /// Insert the user, its first account and (when a password is set) the
    /// first password history row as one unit.
    async fn create_user_with_account(
        &self,
        user: NewUser,
        account: NewAccount,
    ) -> Result<User, StoreError>;

    /// Whether `user_id` has an account with `provider`.
    async fn has_account(&self, user_id: Uuid, provider: &str) -> anyhow::Result<bool>;

    async fn accounts_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Account>>;

    async fn insert_session(&self, session: &Session) -> anyhow::Result<()>;

    async fn find_session(&self, token_hash: &[u8]) -> anyhow::Result<Option<Session>>;

    /// Returns whether a row was removed.
    async fn delete_session(&self, token_hash: &[u8]) -> anyhow::Result<bool>;

    async fn delete_expired_sessions(&self, now: OffsetDateTime) -> anyhow::Result<u64>;
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgAuthStore {
    db: PgPool,
}

impl PgAuthStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthStore for PgAuthStore {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.name, u.email, u.password_hash, u.verified, u.status,
                   u.login_method, u.created_at, u.updated_at
            FROM users u
            JOIN accounts a ON a.user_id = u.id
            WHERE a.provider = $1 AND a.provider_account_id = $2
            "#,
        )
        .bind(provider)
        .bind(provider_account_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn create_user_with_account(
        &self,
        user: NewUser,
        account: NewAccount,
    ) -> Result<User, StoreError> {
        let mut tx = self.db.begin().await?;

        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, name, email, password_hash, verified, login_method)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.verified)
        .bind(user.login_method)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO accounts (provider, provider_account_id, user_id, account_type)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&account.provider)
        .bind(&account.provider_account_id)
        .bind(created.id)
        .bind(&account.account_type)
        .execute(&mut *tx)
        .await?;

        if let Some(hash) = &created.password_hash {
            sqlx::query(
                "INSERT INTO password_history (id, user_id, password_hash) VALUES ($1, $2, $3)",
            )
            .bind(Uuid::new_v4())
            .bind(created.id)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(user_id = %created.id, provider = %account.provider, "user and account created");
        Ok(created)
    }

    async fn has_account(&self, user_id: Uuid, provider: &str) -> anyhow::Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE user_id = $1 AND provider = $2)",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_one(&self.db)
        .await?;
        Ok(exists)
    }

    async fn accounts_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>(
            r#"
            SELECT provider, provider_account_id, user_id, account_type, created_at
            FROM accounts
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn insert_session(&self, session: &Session) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&session.token_hash)
            .bind(session.user_id)
            .bind(session.expires_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn find_session(&self, token_hash: &[u8]) -> anyhow::Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT token_hash, user_id, expires_at FROM sessions WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.db)
        .await?;
        Ok(session)
    }

    async fn delete_session(&self, token_hash: &[u8]) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_sessions(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
