//! In-process `AuthStore` used by unit and router tests.
//!
//! Mirrors the database constraints that matter to the auth flows: unique
//! email, unique (provider, provider_account_id), and all-or-nothing user
//! creation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo::{AuthStore, StoreError};
use crate::auth::repo_types::{Account, NewAccount, NewUser, Session, User, UserStatus};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    accounts: Vec<Account>,
    sessions: HashMap<Vec<u8>, Session>,
    password_history: Vec<(Uuid, String)>,
}

#[derive(Default)]
pub struct MemoryAuthStore {
    tables: Mutex<Tables>,
    /// When set, the account insert inside `create_user_with_account` fails.
    pub fail_account_insert: std::sync::atomic::AtomicBool,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.tables.lock().unwrap().users.len()
    }

    pub fn account_count(&self) -> usize {
        self.tables.lock().unwrap().accounts.len()
    }

    pub fn session_count(&self) -> usize {
        self.tables.lock().unwrap().sessions.len()
    }

    pub fn password_history_for(&self, user_id: Uuid) -> Vec<String> {
        self.tables
            .lock()
            .unwrap()
            .password_history
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, hash)| hash.clone())
            .collect()
    }

    pub fn set_status(&self, user_id: Uuid, status: UserStatus) {
        if let Some(user) = self.tables.lock().unwrap().users.get_mut(&user_id) {
            user.status = status;
        }
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.tables.lock().unwrap().users.get(&id).cloned())
    }

    async fn find_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> anyhow::Result<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .accounts
            .iter()
            .find(|a| a.provider == provider && a.provider_account_id == provider_account_id)
            .and_then(|a| tables.users.get(&a.user_id))
            .cloned())
    }

    async fn create_user_with_account(
        &self,
        user: NewUser,
        account: NewAccount,
    ) -> Result<User, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict);
        }
        if tables.accounts.iter().any(|a| {
            a.provider == account.provider && a.provider_account_id == account.provider_account_id
        }) {
            return Err(StoreError::Conflict);
        }
        // nothing is written before this point, so a failure here leaves no rows
        if self
            .fail_account_insert
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::Other(anyhow::anyhow!("account insert failed")));
        }

        let now = OffsetDateTime::now_utc();
        let created = User {
            id: user.id,
            name: user.name,
            email: user.email,
            password_hash: user.password_hash,
            verified: user.verified,
            status: UserStatus::Active,
            login_method: user.login_method,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.push(Account {
            provider: account.provider,
            provider_account_id: account.provider_account_id,
            user_id: created.id,
            account_type: account.account_type,
            created_at: now,
        });
        if let Some(hash) = &created.password_hash {
            tables.password_history.push((created.id, hash.clone()));
        }
        tables.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn has_account(&self, user_id: Uuid, provider: &str) -> anyhow::Result<bool> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .accounts
            .iter()
            .any(|a| a.user_id == user_id && a.provider == provider))
    }

    async fn accounts_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Account>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .accounts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_session(&self, session: &Session) -> anyhow::Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.sessions.contains_key(&session.token_hash) {
            anyhow::bail!("duplicate session token");
        }
        tables
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, token_hash: &[u8]) -> anyhow::Result<Option<Session>> {
        Ok(self.tables.lock().unwrap().sessions.get(token_hash).cloned())
    }

    async fn delete_session(&self, token_hash: &[u8]) -> anyhow::Result<bool> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .sessions
            .remove(token_hash)
            .is_some())
    }

    async fn delete_expired_sessions(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - tables.sessions.len()) as u64)
    }
}
