pub mod auth;
pub mod config;
pub mod directory;
pub mod err;
pub mod models;
pub mod store;

use std::sync::Arc;

use anyhow::bail;
use axum::handler::Handler;
use axum::{routing::get, routing::post, Extension, Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;

use crate::auth::AccountService;
use crate::config::{Config, StorageBackend};
use crate::directory::DirectoryService;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::store::{AccountStore, FileSessionStore, MemoryAccountStore, PgAccountStore, SessionStore};

pub type Payload<T> = axum::response::Result<Json<Maybe<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Fine(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Nothing(err)))
}

/// Process-wide context handed to every handler: the immutable roster
/// and the account/approval service with its two stores.
pub struct AppState {
    pub auth: AccountService,
    pub directory: DirectoryService,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::load();

    let directory = DirectoryService::from_dir(&config.data_dir).await;

    let accounts = build_account_store(&config).await?;
    let sessions: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(config.session_file.clone()));
    let service = AccountService::new(accounts, sessions);
    if let Err(err) = service
        .ensure_admin_exists(&config.admin_email, &config.admin_password)
        .await
    {
        log::warn!("Could not ensure the admin account exists: {:?}", err);
    }

    let state = Arc::new(AppState {
        auth: service,
        directory,
    });

    let app = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/session", get(auth::current_session))
        .route("/admin/approvals", get(auth::pending_approvals))
        .route("/admin/approvals/:id", post(auth::set_approval))
        .route("/directory/students", get(directory::list_students))
        .route("/directory/students/:key", get(directory::student_by_key))
        .route("/directory/lookup", get(directory::lookup_student))
        .fallback(err::handler404.into_service())
        .layer(ServiceBuilder::new().layer(Extension(state)));

    log::info!(
        "Starting NNRG Connect core service on http://{}",
        config.bind_addr
    );
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn build_account_store(config: &Config) -> anyhow::Result<Arc<dyn AccountStore>> {
    match config.storage {
        StorageBackend::Memory => {
            log::info!("Using the in-memory account store");
            Ok(Arc::new(MemoryAccountStore::new()))
        }
        StorageBackend::Postgres => {
            let url = match config.database_url.as_deref() {
                Some(url) => url,
                None => bail!("DATABASE_URL must be set for the postgres backend"),
            };
            let store = match PgAccountStore::connect(url).await {
                Ok(store) => store,
                Err(err) => bail!("Could not connect the account store: {:?}", err),
            };
            if let Err(err) = store.ensure_schema().await {
                bail!("Could not prepare the accounts schema: {:?}", err);
            }
            log::info!("Using the postgres account store");
            Ok(Arc::new(store))
        }
    }
}
