use super::types::*;
use crate::coordinator::Coordinator;
use crate::core::types::{AliceId, InputProof, OwnershipProof, RoundId};
use crate::error::CoordinatorError;
use crate::round::{NonceInfo, RoundState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, ScriptBuf, Witness};
use std::collections::BTreeMap;
use std::sync::Arc;

type AppState = Arc<Coordinator>;

/// An error body with the status it is served with.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
}

impl ApiError {
    fn bad_request(error: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: error.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.error })).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = match &e {
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::WrongPhase(_) => StatusCode::GONE,
            CoordinatorError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            CoordinatorError::RejectedInput(_) | CoordinatorError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self { status, error: e.to_string() }
    }
}

pub async fn health() -> &'static str {
    "OK"
}

async fn parse_address(coordinator: &Coordinator, address: &str) -> Result<ScriptBuf, ApiError> {
    let network = coordinator.config().await.network;
    let address = address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| ApiError::bad_request(format!("Invalid address: {}.", e)))?
        .require_network(network)
        .map_err(|e| ApiError::bad_request(format!("Invalid address: {}.", e)))?;
    Ok(address.script_pubkey())
}

fn parse_alice_id(s: &str) -> Result<AliceId, ApiError> {
    s.parse().map_err(|_| ApiError::bad_request(format!("Invalid unique id: {}.", s)))
}

pub async fn get_states(State(coordinator): State<AppState>) -> Json<Vec<RoundState>> {
    Json(coordinator.round_states().await)
}

pub async fn get_round_state(
    State(coordinator): State<AppState>,
    Path(round_id): Path<RoundId>,
) -> Result<Json<RoundState>, ApiError> {
    Ok(Json(coordinator.round_state(round_id).await?))
}

pub async fn post_nonces(
    State(coordinator): State<AppState>,
    Path(round_id): Path<RoundId>,
) -> Result<Json<Vec<NonceInfo>>, ApiError> {
    Ok(Json(coordinator.nonces(round_id).await?))
}

pub async fn post_inputs(
    State(coordinator): State<AppState>,
    Json(req): Json<InputsRequest>,
) -> Result<Json<InputsResponse>, ApiError> {
    let change_script = parse_address(&coordinator, &req.change_output_address).await?;
    let inputs = req
        .inputs
        .iter()
        .map(|i| {
            let proof = OwnershipProof::try_from(&i.proof)
                .map_err(|e| ApiError::bad_request(format!("Invalid proof hex: {}.", e)))?;
            Ok(InputProof { outpoint: i.outpoint, proof })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let unique_id = coordinator
        .register_alice(req.round_id, inputs, req.blinded_output_scripts, change_script)
        .await?;
    Ok(Json(InputsResponse { unique_id, round_id: req.round_id }))
}

pub async fn post_confirmation(
    State(coordinator): State<AppState>,
    Query(query): Query<AliceQuery>,
) -> Result<Json<ConfirmationResponse>, ApiError> {
    let alice_id = parse_alice_id(&query.unique_id)?;
    let (phase, sigs) = coordinator.confirm_connection(query.round_id, &alice_id).await?;
    Ok(Json(ConfirmationResponse {
        current_phase: phase.name().to_string(),
        blind_signatures: sigs.unwrap_or_default(),
    }))
}

pub async fn post_unconfirmation(
    State(coordinator): State<AppState>,
    Query(query): Query<AliceQuery>,
) -> StatusCode {
    if let Ok(alice_id) = query.unique_id.parse::<AliceId>() {
        coordinator.unconfirm(query.round_id, &alice_id).await;
    }
    StatusCode::OK
}

pub async fn post_output(
    State(coordinator): State<AppState>,
    Json(req): Json<OutputRequest>,
) -> Result<StatusCode, ApiError> {
    let output = req.active_output;
    let script = parse_address(&coordinator, &output.address).await?;
    coordinator
        .register_output(req.round_id, script, output.signature, output.level)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn get_coinjoin(
    State(coordinator): State<AppState>,
    Path(round_id): Path<RoundId>,
) -> Result<Json<CoinjoinResponse>, ApiError> {
    let tx = coordinator.get_unsigned_coinjoin(round_id).await?;
    Ok(Json(CoinjoinResponse { transaction: bitcoin::consensus::encode::serialize_hex(&tx) }))
}

pub async fn post_signatures(
    State(coordinator): State<AppState>,
    Json(req): Json<SignaturesRequest>,
) -> Result<StatusCode, ApiError> {
    let alice_id = parse_alice_id(&req.unique_id)?;
    let mut witnesses = BTreeMap::new();
    for (index, items) in &req.witnesses {
        let items = items
            .iter()
            .map(hex::decode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::bad_request(format!("Invalid witness hex: {}.", e)))?;
        witnesses.insert(*index, Witness::from_slice(&items));
    }
    coordinator
        .post_signatures(req.round_id, &alice_id, witnesses)
        .await?;
    Ok(StatusCode::OK)
}
