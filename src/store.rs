use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::fs::{create_dir_all, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{ApprovalStatus, Session, UserAccount, UserRole};

/// Account persistence. Uniqueness of the (normalized) email, and of the
/// roll number among student accounts, is enforced here rather than by
/// the caller's pre-checks, so two racing registrations cannot both win.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// `email` must already be normalized (trimmed, lowercased).
    async fn find_by_email(&self, email: &str) -> Result<Option<UserAccount>, Error>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, Error>;
    async fn insert(&self, account: UserAccount) -> Result<UserAccount, Error>;
    async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<Option<UserAccount>, Error>;
    async fn list_by_role_and_status(
        &self,
        role: UserRole,
        status: ApprovalStatus,
    ) -> Result<Vec<UserAccount>, Error>;
}

/// The single device-local session slot. Not a multi-session registry:
/// putting a session replaces whatever was there.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session: Session) -> Result<(), Error>;
    async fn get(&self) -> Result<Option<Session>, Error>;
    async fn clear(&self) -> Result<(), Error>;
}

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|err| Error::storage("accounts.connect", err))?;
        Ok(Self { pool })
    }

    /// Creates the accounts table and the unique indexes that close the
    /// registration race at the storage layer.
    pub async fn ensure_schema(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                roll_number TEXT,
                id_card_image TEXT,
                approval_status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::storage("accounts.ensure_schema", err))?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS accounts_email_key ON accounts (email)")
            .execute(&self.pool)
            .await
            .map_err(|err| Error::storage("accounts.ensure_schema", err))?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS accounts_roll_number_key
             ON accounts (roll_number)
             WHERE role = 'student' AND roll_number IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::storage("accounts.ensure_schema", err))?;

        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserAccount>, Error> {
        sqlx::query_as::<_, UserAccount>("SELECT * FROM accounts WHERE email = $1 LIMIT 1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| Error::storage("accounts.find_by_email", err))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, Error> {
        sqlx::query_as::<_, UserAccount>("SELECT * FROM accounts WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| Error::storage("accounts.find_by_id", err))
    }

    async fn insert(&self, account: UserAccount) -> Result<UserAccount, Error> {
        sqlx::query(
            "INSERT INTO accounts VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(account.id)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(&account.name)
        .bind(account.role)
        .bind(&account.roll_number)
        .bind(&account.id_card_image)
        .bind(account.approval_status)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::storage("accounts.insert", err))?;
        Ok(account)
    }

    async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<Option<UserAccount>, Error> {
        sqlx::query_as::<_, UserAccount>(
            "UPDATE accounts SET approval_status = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| Error::storage("accounts.update_approval_status", err))
    }

    async fn list_by_role_and_status(
        &self,
        role: UserRole,
        status: ApprovalStatus,
    ) -> Result<Vec<UserAccount>, Error> {
        sqlx::query_as::<_, UserAccount>(
            "SELECT * FROM accounts WHERE role = $1 AND approval_status = $2 ORDER BY created_at",
        )
        .bind(role)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::storage("accounts.list_by_role_and_status", err))
    }
}

/// Test-double account store. Uniqueness checks run under the write
/// lock, giving the same race-free insert contract as the database.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<Vec<UserAccount>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserAccount>, Error> {
        let accounts = self.accounts.read().await;
        Ok(accounts.iter().find(|a| a.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, Error> {
        let accounts = self.accounts.read().await;
        Ok(accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn insert(&self, account: UserAccount) -> Result<UserAccount, Error> {
        let mut accounts = self.accounts.write().await;
        if accounts.iter().any(|a| a.email == account.email) {
            return Err(Error::DuplicateAccount {
                message: format!("Account with email `{}` already exists", account.email),
            });
        }
        if account.role == UserRole::Student {
            if let Some(roll) = &account.roll_number {
                let taken = accounts
                    .iter()
                    .any(|a| a.role == UserRole::Student && a.roll_number.as_deref() == Some(roll));
                if taken {
                    return Err(Error::DuplicateAccount {
                        message: format!("Account with roll number `{}` already exists", roll),
                    });
                }
            }
        }
        accounts.push(account.clone());
        Ok(account)
    }

    async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<Option<UserAccount>, Error> {
        let mut accounts = self.accounts.write().await;
        Ok(accounts.iter_mut().find(|a| a.id == id).map(|account| {
            account.approval_status = status;
            account.clone()
        }))
    }

    async fn list_by_role_and_status(
        &self,
        role: UserRole,
        status: ApprovalStatus,
    ) -> Result<Vec<UserAccount>, Error> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .iter()
            .filter(|a| a.role == role && a.approval_status == status)
            .cloned()
            .collect())
    }
}

/// Session slot persisted as one postcard-encoded file, so the device
/// stays signed in across restarts. An unreadable slot is discarded and
/// reported as absent, never as an error.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn put(&self, session: Session) -> Result<(), Error> {
        let bytes = postcard::to_allocvec(&session)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).await?;
            }
        }
        let file = File::create(&self.path).await?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn get(&self) -> Result<Option<Session>, Error> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match postcard::from_bytes::<Session>(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                log::warn!("Discarding unreadable session slot: {}", err);
                let _ = tokio::fs::remove_file(&self.path).await;
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    slot: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: Session) -> Result<(), Error> {
        *self.slot.write().await = Some(session);
        Ok(())
    }

    async fn get(&self) -> Result<Option<Session>, Error> {
        Ok(self.slot.read().await.clone())
    }

    async fn clear(&self) -> Result<(), Error> {
        *self.slot.write().await = None;
        Ok(())
    }
}
