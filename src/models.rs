use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

/// One normalized row of the student directory. Field values are copied
/// through from the source batches with empty-string defaults; `batch` and
/// `department` are derived from the roll number at ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: String,
    pub roll_number: String,
    pub name: String,
    pub email: String,
    pub batch: String,
    pub department: String,
    pub father_name: String,
    pub mother_name: String,
    pub gender: String,
    pub dob: String,
    pub address: String,
    pub category: String,
    pub caste: String,
    pub aadhar_number: String,
    pub phone_number: String,
    pub parent_phone_number: String,
}

/// A registered account. The email is stored normalized (trimmed,
/// lowercased) and is unique across accounts; the roll number is unique
/// among student accounts when present.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub role: UserRole,
    pub roll_number: Option<String>,
    pub id_card_image: Option<String>,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    /// Password-free projection handed to sessions and listings.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            email: self.email.clone(),
            name: self.name.clone(),
            role: self.role,
            approval_status: self.approval_status,
            roll_number: self.roll_number.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub approval_status: ApprovalStatus,
    pub roll_number: Option<String>,
}

/// The device-local session: who is currently using this app instance.
/// Bound to an account's public profile, never to password material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: UserProfile,
    pub created_at: DateTime<Utc>,
}
