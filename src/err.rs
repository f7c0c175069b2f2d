#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

use crate::models::ApprovalStatus;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => Json::into_response(Json(err)),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Every failure the presentation layer must be able to tell apart.
/// Storage outages are propagated with the failing operation attached;
/// nothing is collapsed into a generic error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    DuplicateAccount { message: String },
    AccountNotFound { message: String },
    InvalidPassword { message: String },
    AccountNotApproved { status: ApprovalStatus, message: String },
    MissingCredentials { message: String },
    InvalidPayload { message: String },
    Unauthorized { message: String },
    NotFound { message: String },
    StorageUnavailable { operation: &'static str, message: String },
    InternalError { kind: &'static str, message: String },
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        Json::into_response(Json(self))
    }
}

impl Error {
    /// Maps a database error for `operation`, turning unique-constraint
    /// violations into `DuplicateAccount` (the storage layer is what
    /// enforces account uniqueness).
    pub fn storage(operation: &'static str, err: sqlx::Error) -> Error {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("23505") {
                return Error::DuplicateAccount {
                    message: db.message().to_string(),
                };
            }
        }
        Error::StorageUnavailable {
            operation,
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Self::InternalError {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::InternalError {
            kind: "CredentialError",
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_carries_flag_and_value() {
        #[derive(Serialize)]
        struct Out {
            answer: u32,
        }
        let json = serde_json::to_value(Fine(Out { answer: 42 })).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["answer"], 42);
    }

    #[test]
    fn error_envelope_is_tagged_with_the_kind() {
        let err: Maybe<()> = Nothing(Error::DuplicateAccount {
            message: "taken".to_string(),
        });
        let json = serde_json::to_value(err).unwrap();
        assert_eq!(json["error"], "DuplicateAccount");
        assert_eq!(json["message"], "taken");
    }

    #[test]
    fn approval_error_carries_the_current_status() {
        let err = Error::AccountNotApproved {
            status: ApprovalStatus::Rejected,
            message: "Your account is rejected.".to_string(),
        };
        let json = serde_json::to_value(err).unwrap();
        assert_eq!(json["error"], "AccountNotApproved");
        assert_eq!(json["status"], "rejected");
    }
}
