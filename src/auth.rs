use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};
use chrono::Utc;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::err::Error;
use crate::models::{ApprovalStatus, Session, StudentRecord, UserAccount, UserProfile, UserRole};
use crate::store::{AccountStore, SessionStore};
use crate::{breaks, proceeds, AppState, Payload};

/// The account and approval state machine. Students register into
/// Pending, an admin moves them to Approved or Rejected, and only
/// Approved students (or admins) get past the login gate. The service
/// never checks who its caller is; the HTTP surface gates the admin
/// operations.
pub struct AccountService {
    accounts: Arc<dyn AccountStore>,
    sessions: Arc<dyn SessionStore>,
}

impl AccountService {
    pub fn new(accounts: Arc<dyn AccountStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { accounts, sessions }
    }

    /// Creates a Pending student account. Registration never establishes
    /// a session; the caller logs in separately once approved.
    pub async fn register(&self, req: RegisterRequest) -> Result<UserProfile, Error> {
        let email = normalize_email(&req.email);
        if email.is_empty() {
            return Err(Error::MissingCredentials {
                message: "Provided email was empty!".to_string(),
            });
        }
        if req.password.is_empty() {
            return Err(Error::MissingCredentials {
                message: "Provided password was empty!".to_string(),
            });
        }
        if req.name.trim().is_empty() {
            return Err(Error::MissingCredentials {
                message: "Provided name was empty!".to_string(),
            });
        }

        // Fast duplicate check; the store's unique constraints are what
        // actually close the race.
        if self.accounts.find_by_email(&email).await?.is_some() {
            return Err(Error::DuplicateAccount {
                message: format!("Account with email `{}` already exists", email),
            });
        }

        let account = UserAccount {
            id: Uuid::new_v4(),
            email,
            password_hash: hash_password(&req.password)?,
            name: req.name.trim().to_string(),
            role: UserRole::Student,
            roll_number: non_empty(req.roll_number),
            id_card_image: non_empty(req.id_card_image),
            approval_status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        };
        let account = self.accounts.insert(account).await?;
        log::info!("Registered student account {} (pending approval)", account.id);
        Ok(account.profile())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, Error> {
        if password.is_empty() {
            return Err(Error::InvalidPayload {
                message: "`password` parameter was empty".to_string(),
            });
        }
        let email = normalize_email(email);

        let account = self
            .accounts
            .find_by_email(&email)
            .await?
            .ok_or_else(|| Error::AccountNotFound {
                message: format!("No account for `{}`", email),
            })?;

        let hash = PasswordHash::new(&account.password_hash)?;
        if Pbkdf2
            .verify_password(password.as_bytes(), &hash)
            .is_err()
        {
            return Err(Error::InvalidPassword {
                message: "Passwords do not match!".to_string(),
            });
        }

        // Approval gate: admins bypass it entirely.
        if account.role == UserRole::Student
            && account.approval_status != ApprovalStatus::Approved
        {
            return Err(Error::AccountNotApproved {
                status: account.approval_status,
                message: format!(
                    "Your account is {}. Please wait for admin approval.",
                    account.approval_status.as_str()
                ),
            });
        }

        let session = Session {
            token: session_token(),
            user: account.profile(),
            created_at: Utc::now(),
        };
        self.sessions.put(session.clone()).await?;
        Ok(session)
    }

    /// Clears the session slot. Idempotent: logging out with no active
    /// session is not an error.
    pub async fn logout(&self) -> Result<(), Error> {
        self.sessions.clear().await
    }

    pub async fn current_session(&self) -> Result<Option<Session>, Error> {
        self.sessions.get().await
    }

    /// Student accounts still waiting for a decision, in storage order,
    /// with the password hash excluded by construction.
    pub async fn list_pending_approvals(&self) -> Result<Vec<UserProfile>, Error> {
        let accounts = self
            .accounts
            .list_by_role_and_status(UserRole::Student, ApprovalStatus::Pending)
            .await?;
        Ok(accounts.iter().map(UserAccount::profile).collect())
    }

    /// Applies an admin decision. There is no path back to Pending, and
    /// an already-established session for the account is left untouched.
    pub async fn set_approval(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<UserProfile, Error> {
        let updated = self
            .accounts
            .update_approval_status(id, decision.into_status())
            .await?;
        match updated {
            Some(account) => {
                log::info!(
                    "Account {} marked {}",
                    account.id,
                    account.approval_status.as_str()
                );
                Ok(account.profile())
            }
            None => Err(Error::AccountNotFound {
                message: format!("No account with id `{}`", id),
            }),
        }
    }

    /// Seeds the admin account on startup if it is missing. Admins are
    /// created Approved; they never pass through the Pending state.
    pub async fn ensure_admin_exists(&self, email: &str, password: &str) -> Result<(), Error> {
        let email = normalize_email(email);
        if self.accounts.find_by_email(&email).await?.is_some() {
            return Ok(());
        }
        let admin = UserAccount {
            id: Uuid::new_v4(),
            email,
            password_hash: hash_password(password)?,
            name: "System Admin".to_string(),
            role: UserRole::Admin,
            roll_number: None,
            id_card_image: None,
            approval_status: ApprovalStatus::Approved,
            created_at: Utc::now(),
        };
        match self.accounts.insert(admin).await {
            Ok(account) => {
                log::info!("Admin account {} created", account.email);
                Ok(())
            }
            // Another process seeded it first
            Err(Error::DuplicateAccount { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

fn session_token() -> String {
    let token_bytes: [u8; 32] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(token_bytes);
    hex::encode(hasher.finalize())
}

/// An admin decision. Pending is not a legal target: a reviewed
/// account never goes back to waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn into_status(self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        }
    }
}

async fn require_admin(state: &AppState) -> Result<Session, Error> {
    let session = state
        .auth
        .current_session()
        .await?
        .ok_or_else(|| Error::Unauthorized {
            message: "No active session".to_string(),
        })?;
    if session.user.role != UserRole::Admin {
        return Err(Error::Unauthorized {
            message: "Admin role required".to_string(),
        });
    }
    Ok(session)
}

pub async fn register(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Payload<UserProfile> {
    match state.auth.register(body).await {
        Ok(profile) => proceeds(profile),
        Err(err) => breaks(err),
    }
}

pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Payload<LoggedIn> {
    match state.auth.login(&body.email, &body.password).await {
        Ok(session) => {
            // Enrich with the directory record when the email matches
            let student = state.directory.find_by_email(&session.user.email).cloned();
            proceeds(LoggedIn { session, student })
        }
        Err(err) => breaks(err),
    }
}

pub async fn logout(Extension(state): Extension<Arc<AppState>>) -> Payload<LoggedOut> {
    match state.auth.logout().await {
        Ok(()) => proceeds(LoggedOut { logged_out: true }),
        Err(err) => breaks(err),
    }
}

pub async fn current_session(Extension(state): Extension<Arc<AppState>>) -> Payload<SessionSnapshot> {
    match state.auth.current_session().await {
        Ok(session) => proceeds(SessionSnapshot {
            authenticated: session.is_some(),
            session,
        }),
        Err(err) => breaks(err),
    }
}

pub async fn pending_approvals(
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<PendingApprovals> {
    if let Err(err) = require_admin(&state).await {
        return breaks(err);
    }
    match state.auth.list_pending_approvals().await {
        Ok(accounts) => proceeds(PendingApprovals { accounts }),
        Err(err) => breaks(err),
    }
}

pub async fn set_approval(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetApproval>,
) -> Payload<UserProfile> {
    if let Err(err) = require_admin(&state).await {
        return breaks(err);
    }
    match state.auth.set_approval(id, body.status).await {
        Ok(profile) => proceeds(profile),
        Err(err) => breaks(err),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub roll_number: String,
    #[serde(default)]
    pub id_card_image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    #[serde(flatten)]
    pub session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<StudentRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedOut {
    pub logged_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetApproval {
    pub status: ApprovalDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApprovals {
    pub accounts: Vec<UserProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAccountStore, MemorySessionStore};

    fn service() -> AccountService {
        AccountService::new(
            Arc::new(MemoryAccountStore::new()),
            Arc::new(MemorySessionStore::new()),
        )
    }

    fn student_request(email: &str, password: &str, roll: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            name: "Test Student".to_string(),
            roll_number: roll.to_string(),
            id_card_image: String::new(),
        }
    }

    #[tokio::test]
    async fn registration_creates_pending_student_without_session() {
        let service = service();
        let profile = service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        assert_eq!(profile.role, UserRole::Student);
        assert_eq!(profile.approval_status, ApprovalStatus::Pending);
        assert_eq!(profile.roll_number.as_deref(), Some("197Z1A0101"));
        // No session is established by registration
        assert!(service.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_fails_the_second_registration() {
        let service = service();
        service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        let err = service
            .register(student_request("stu1@nnrg.edu.in", "other", "197Z1A0102"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAccount { .. }));
    }

    #[tokio::test]
    async fn emails_are_normalized_before_comparison() {
        let service = service();
        service
            .register(student_request("  User@NNRG.Edu.In ", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        let err = service
            .register(student_request("user@nnrg.edu.in", "other", "197Z1A0102"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAccount { .. }));
    }

    #[tokio::test]
    async fn blank_registration_fields_fail_before_any_write() {
        let service = service();
        let err = service
            .register(student_request("stu1@nnrg.edu.in", "", "197Z1A0101"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCredentials { .. }));
        let err = service
            .register(student_request("   ", "secret1", "197Z1A0101"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCredentials { .. }));
        // Nothing was persisted by the failed attempts
        assert!(service.list_pending_approvals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_is_gated_until_approval() {
        let service = service();
        service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        let err = service
            .login("stu1@nnrg.edu.in", "secret1")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::AccountNotApproved {
                status: ApprovalStatus::Pending,
                message: "Your account is pending. Please wait for admin approval.".to_string(),
            }
        );
        assert!(service.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_account_stays_locked_out() {
        let service = service();
        let profile = service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        service
            .set_approval(profile.id, ApprovalDecision::Rejected)
            .await
            .unwrap();
        let err = service
            .login("stu1@nnrg.edu.in", "secret1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AccountNotApproved {
                status: ApprovalStatus::Rejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn approval_then_login_establishes_session() {
        let service = service();
        let profile = service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();

        let approved = service
            .set_approval(profile.id, ApprovalDecision::Approved)
            .await
            .unwrap();
        assert_eq!(approved.approval_status, ApprovalStatus::Approved);

        let session = service.login("stu1@nnrg.edu.in", "secret1").await.unwrap();
        assert_eq!(session.user.email, "stu1@nnrg.edu.in");
        assert_eq!(session.user.role, UserRole::Student);
        assert!(!session.token.is_empty());

        let current = service.current_session().await.unwrap().unwrap();
        assert_eq!(current.user.email, "stu1@nnrg.edu.in");
    }

    #[tokio::test]
    async fn wrong_password_fails_without_creating_a_session() {
        let service = service();
        let profile = service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        service
            .set_approval(profile.id, ApprovalDecision::Approved)
            .await
            .unwrap();

        let err = service
            .login("stu1@nnrg.edu.in", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPassword { .. }));
        assert!(service.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_email_fails_with_account_not_found() {
        let service = service();
        let err = service
            .login("nobody@nnrg.edu.in", "secret1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound { .. }));
    }

    #[tokio::test]
    async fn logout_clears_the_session_and_is_idempotent() {
        let service = service();
        let profile = service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        service
            .set_approval(profile.id, ApprovalDecision::Approved)
            .await
            .unwrap();
        service.login("stu1@nnrg.edu.in", "secret1").await.unwrap();

        service.logout().await.unwrap();
        assert!(service.current_session().await.unwrap().is_none());
        // A second logout with no active session is fine
        service.logout().await.unwrap();
    }

    #[tokio::test]
    async fn admin_bypasses_the_approval_gate() {
        let service = service();
        service
            .ensure_admin_exists("admin@nnrg.edu.in", "admin123")
            .await
            .unwrap();
        let session = service.login("admin@nnrg.edu.in", "admin123").await.unwrap();
        assert_eq!(session.user.role, UserRole::Admin);
        assert_eq!(session.user.approval_status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn admin_seeding_is_idempotent() {
        let service = service();
        service
            .ensure_admin_exists("admin@nnrg.edu.in", "admin123")
            .await
            .unwrap();
        service
            .ensure_admin_exists("admin@nnrg.edu.in", "admin123")
            .await
            .unwrap();
        // The original credentials still work
        service.login("admin@nnrg.edu.in", "admin123").await.unwrap();
    }

    #[tokio::test]
    async fn pending_listing_returns_students_only() {
        let service = service();
        service
            .ensure_admin_exists("admin@nnrg.edu.in", "admin123")
            .await
            .unwrap();
        service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        let stu2 = service
            .register(student_request("stu2@nnrg.edu.in", "secret2", "197Z1A0102"))
            .await
            .unwrap();
        service
            .set_approval(stu2.id, ApprovalDecision::Approved)
            .await
            .unwrap();

        let pending = service.list_pending_approvals().await.unwrap();
        let emails: Vec<&str> = pending.iter().map(|p| p.email.as_str()).collect();
        assert_eq!(emails, ["stu1@nnrg.edu.in"]);
    }

    #[tokio::test]
    async fn set_approval_on_unknown_account_fails() {
        let service = service();
        let err = service
            .set_approval(Uuid::new_v4(), ApprovalDecision::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound { .. }));
    }

    #[tokio::test]
    async fn approval_does_not_touch_an_established_session() {
        let service = service();
        let profile = service
            .register(student_request("stu1@nnrg.edu.in", "secret1", "197Z1A0101"))
            .await
            .unwrap();
        service
            .set_approval(profile.id, ApprovalDecision::Approved)
            .await
            .unwrap();
        service.login("stu1@nnrg.edu.in", "secret1").await.unwrap();

        // A later decision flips the stored status but the session stays
        service
            .set_approval(profile.id, ApprovalDecision::Rejected)
            .await
            .unwrap();
        let current = service.current_session().await.unwrap().unwrap();
        assert_eq!(current.user.email, "stu1@nnrg.edu.in");
    }
}
