#![allow(unused)]
use crate::acl::HostAcl;
use crate::api::*;
use crate::db::{SQLite, DB};
use crate::decrypt::{DecryptError, DecryptionOracle};
use crate::fhe::TestFhe;
use crate::mercado::{Mercado, MercadoError};
use crate::oracle::Oracle;
use crate::settings::Settings;
use anyhow::{bail, Result};
use axum::extract::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use axum_macros::debug_handler;
use clap::Parser;
use env_logger::{Builder, WriteStyle};
use log::{debug, error, info, trace};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

mod acl;
mod api;
mod client;
mod db;
mod decrypt;
mod fhe;
mod ledger;
mod mercado;
mod oracle;
mod settings;

#[derive(Clone)]
struct AppState {
    mercado: Arc<RwLock<Mercado>>,
    oracle: Arc<Oracle>,
}

fn map_mercado_err(e: MercadoError) -> (StatusCode, String) {
    if let MercadoError::Internal(e) = &e {
        error!("{:#}", e);
    }
    (e.status_code(), e.to_string())
}
fn map_decrypt_err(e: DecryptError) -> (StatusCode, Json<DecryptDenied>) {
    let code = match e {
        DecryptError::ExpiredWindow | DecryptError::BadSignature => StatusCode::UNAUTHORIZED,
        DecryptError::AclDenied => StatusCode::FORBIDDEN,
        DecryptError::OracleUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(DecryptDenied { reason: e }))
}

async fn get_login_challenge(
    State(state): State<AppState>,
    Json(user): Json<UserPubKey>,
) -> Result<String, (StatusCode, String)> {
    let mut backend = state.mercado.write().await;
    trace!("Getting login challenge for {}", user);
    let challenge = backend
        .create_login_challenge(&user)
        .await
        .map_err(map_mercado_err)?;
    debug!("Login challenge for user {}: {}", user, challenge);
    Ok(challenge)
}
async fn try_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<(), (StatusCode, String)> {
    let mut backend = state.mercado.write().await;
    backend
        .try_login(&request.user, &request.sig, &request.challenge)
        .await
        .map_err(map_mercado_err)?;
    debug!("User {} successfully logged in", request.user);
    Ok(())
}
#[debug_handler]
async fn register(
    State(state): State<AppState>,
    Json(access): Json<AccessRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut backend = state.mercado.write().await;
    let user = backend.check_access(&access).await.map_err(map_mercado_err)?;
    backend.register(&user).await.map_err(map_mercado_err)?;
    Ok(StatusCode::CREATED)
}
#[debug_handler]
async fn create_prediction(
    State(state): State<AppState>,
    Json(request): Json<PostRequest<NewPredictionRequest>>,
) -> Result<(StatusCode, Json<PredictionId>), (StatusCode, String)> {
    let mut backend = state.mercado.write().await;
    let user = backend
        .check_access(&request.access)
        .await
        .map_err(map_mercado_err)?;
    let prediction = request.data;
    let id = backend
        .create_prediction(&user, prediction.title.clone(), prediction.options)
        .await
        .map_err(map_mercado_err)?;
    debug!("Created Prediction {}: {}", id, prediction.title);
    Ok((StatusCode::CREATED, id.into()))
}
#[debug_handler]
async fn place_bet(
    State(state): State<AppState>,
    Json(request): Json<PostRequest<PlaceBetRequest>>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut backend = state.mercado.write().await;
    let user = backend
        .check_access(&request.access)
        .await
        .map_err(map_mercado_err)?;
    let bet = request.data;
    backend
        .place_bet(&user, bet.prediction, &bet.choice, &bet.proof)
        .await
        .map_err(map_mercado_err)?;
    Ok(StatusCode::CREATED)
}
#[debug_handler]
async fn encrypt_input(
    State(state): State<AppState>,
    Json(request): Json<PostRequest<EncryptInputRequest>>,
) -> Result<Json<EncryptedInput>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    let user = backend
        .check_access(&request.access)
        .await
        .map_err(map_mercado_err)?;
    let input = backend
        .encrypt_input(&user, request.data.value)
        .await
        .map_err(map_mercado_err)?;
    Ok(Json(input))
}
async fn is_registered(
    State(state): State<AppState>,
    Json(user): Json<UserPubKey>,
) -> Result<Json<bool>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend.is_registered(&user).await.map_err(map_mercado_err)?,
    ))
}
async fn get_remaining_bets(
    State(state): State<AppState>,
    Json(user): Json<UserPubKey>,
) -> Result<Json<u32>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .get_remaining_bets(&user)
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_encrypted_balance(
    State(state): State<AppState>,
    Json(user): Json<UserPubKey>,
) -> Result<Json<Handle>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .get_encrypted_balance(&user)
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_prediction_count(
    State(state): State<AppState>,
) -> Result<Json<u64>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .get_prediction_count()
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_prediction(
    State(state): State<AppState>,
    Json(request): Json<PredictionRequest>,
) -> Result<Json<Prediction>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .get_prediction(request.prediction)
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_predictions(
    State(state): State<AppState>,
) -> Result<Json<Vec<Prediction>>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend.get_predictions().await.map_err(map_mercado_err)?,
    ))
}
async fn has_user_bet(
    State(state): State<AppState>,
    Json(request): Json<UserBetRequest>,
) -> Result<Json<bool>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .has_user_bet(request.prediction, &request.user)
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_user_encrypted_choice(
    State(state): State<AppState>,
    Json(request): Json<UserBetRequest>,
) -> Result<Json<Handle>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .get_user_encrypted_choice(request.prediction, &request.user)
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_user_encrypted_bet_amount(
    State(state): State<AppState>,
    Json(request): Json<UserBetRequest>,
) -> Result<Json<Handle>, (StatusCode, String)> {
    let backend = state.mercado.read().await;
    Ok(Json(
        backend
            .get_user_encrypted_bet_amount(request.prediction, &request.user)
            .await
            .map_err(map_mercado_err)?,
    ))
}
async fn get_market_info(State(state): State<AppState>) -> Json<MarketInfo> {
    Json(state.mercado.read().await.market_info())
}
#[debug_handler]
async fn user_decrypt(
    State(state): State<AppState>,
    Json(request): Json<UserDecryptRequest>,
) -> Result<Json<UserDecryptResponse>, (StatusCode, Json<DecryptDenied>)> {
    let response = state
        .oracle
        .user_decrypt(&request)
        .await
        .map_err(map_decrypt_err)?;
    Ok(Json(response))
}

#[derive(Parser)]
struct Args {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long)]
    db: Option<String>,
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if cli.db.is_some() {
        settings.db = cli.db;
    }
    Builder::default()
        .filter_level(settings.level())
        .write_style(WriteStyle::Always)
        .init();
    let (_port, handle) = run_server(settings).await?;
    handle.await?;
    Ok(())
}

async fn run_server(settings: Settings) -> Result<(u16, JoinHandle<()>)> {
    let db: Arc<Box<dyn DB + Send + Sync>> = Arc::new(Box::new(SQLite::new(settings.db).await?));
    let fhe = Arc::new(TestFhe::persistent(db.clone()).await?);
    let acl = Arc::new(HostAcl::persistent(db.clone()).await?);
    let contract = market_contract(&**db, settings.contract).await?;
    info!("Market contract {}", contract);
    let state = AppState {
        mercado: Arc::new(RwLock::new(Mercado::new(db, fhe.clone(), acl.clone(), contract))),
        oracle: Arc::new(Oracle::new(fhe, acl)),
    };
    let app = Router::new()
        .route("/get_login_challenge", post(get_login_challenge))
        .route("/try_login", post(try_login))
        .route("/register", post(register))
        .route("/create_prediction", post(create_prediction))
        .route("/place_bet", post(place_bet))
        .route("/encrypt_input", post(encrypt_input))
        .route("/is_registered", post(is_registered))
        .route("/get_remaining_bets", post(get_remaining_bets))
        .route("/get_encrypted_balance", post(get_encrypted_balance))
        .route("/get_prediction_count", get(get_prediction_count))
        .route("/get_prediction", post(get_prediction))
        .route("/get_predictions", get(get_predictions))
        .route("/has_user_bet", post(has_user_bet))
        .route("/get_user_encrypted_choice", post(get_user_encrypted_choice))
        .route(
            "/get_user_encrypted_bet_amount",
            post(get_user_encrypted_bet_amount),
        )
        .route("/get_market_info", get(get_market_info))
        .route("/user_decrypt", post(user_decrypt))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], settings.port));
    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    let port = server.local_addr().port();
    debug!("Listening on {}", server.local_addr());
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Server stopped: {}", e);
        }
    });
    Ok((port, handle))
}

/// The contract stored handles were granted to. A fresh database takes the
/// configured one, or a random one.
async fn market_contract(
    db: &(dyn DB + Send + Sync),
    configured: Option<ContractAddress>,
) -> Result<ContractAddress> {
    match (db.get_contract().await?, configured) {
        (Some(stored), Some(configured)) if stored != configured => {
            bail!(
                "Database belongs to contract {} but {} is configured",
                stored,
                configured
            )
        }
        (Some(stored), _) => Ok(stored),
        (None, configured) => {
            let contract = configured.unwrap_or_else(ContractAddress::random);
            db.set_contract(&contract).await?;
            Ok(contract)
        }
    }
}
