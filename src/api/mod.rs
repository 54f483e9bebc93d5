//! JSON HTTP surface over the node.
//!
//! Handlers never touch consensus state directly; every query crosses into
//! the event loop through [`NodeHandle`] and comes back over a oneshot.
//! Unknown addresses and heights map to 404, everything else that fails
//! maps to 500 wrapping the error text, and template/transfer responses
//! are pure artifacts with no chain side-effects.

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::core::address::Address;
use crate::core::block::Block;
use crate::core::transaction::{Transaction, TransferTx};
use crate::node::NodeHandle;

pub async fn serve(addr: SocketAddr, handle: NodeHandle) {
    let app = Router::new()
        .route("/peers", get(known_peers))
        .route("/address/:address", get(address_state))
        .route("/block/:number", get(block_by_number))
        .route("/block-template", get(block_template))
        .route("/submit-block", post(submit_block))
        .route("/transfer", post(build_transfer))
        .route("/tx", post(submit_transaction))
        .layer(CorsLayer::permissive())
        .with_state(handle);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, "api bind failed: {err}");
            return;
        }
    };
    info!(%addr, "api listening");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("api server stopped: {err}");
    }
}

enum ApiError {
    NotFound,
    Unknown(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "not found"})))
                    .into_response()
            }
            ApiError::Unknown(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": msg})))
                    .into_response()
            }
        }
    }
}

fn loop_gone<T>(value: Option<T>) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::Unknown("node loop unavailable".to_string()))
}

fn parse_address(s: &str) -> Result<Address, ApiError> {
    Address::from_qstring(s).map_err(|e| ApiError::Unknown(e.to_string()))
}

async fn known_peers(State(handle): State<NodeHandle>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(loop_gone(handle.known_peers().await)?))
}

#[derive(Serialize)]
struct AddressStateResponse {
    address: String,
    balance: u64,
    nonce: u64,
    used_ots: Vec<u64>,
    tokens: Vec<TokenBalance>,
}

#[derive(Serialize)]
struct TokenBalance {
    token_txhash: String,
    balance: u64,
}

async fn address_state(
    State(handle): State<NodeHandle>,
    Path(address): Path<String>,
) -> Result<Json<AddressStateResponse>, ApiError> {
    let address = parse_address(&address)?;
    let state = loop_gone(handle.address_state(address).await)?.ok_or(ApiError::NotFound)?;
    Ok(Json(AddressStateResponse {
        address: state.address.to_string(),
        balance: state.balance,
        nonce: state.nonce,
        used_ots: state.ots_bitfield.used_indices(),
        tokens: state
            .tokens
            .iter()
            .map(|(hash, balance)| TokenBalance {
                token_txhash: hex::encode(hash),
                balance: *balance,
            })
            .collect(),
    }))
}

#[derive(Serialize)]
struct BlockResponse {
    headerhash: String,
    block: Block,
    block_difficulty: String,
    cumulative_difficulty: String,
    orphan: bool,
}

async fn block_by_number(
    State(handle): State<NodeHandle>,
    Path(number): Path<u64>,
) -> Result<Json<BlockResponse>, ApiError> {
    let (block, meta) =
        loop_gone(handle.block_by_number(number).await)?.ok_or(ApiError::NotFound)?;
    Ok(Json(BlockResponse {
        headerhash: hex::encode(block.header_hash()),
        block_difficulty: meta.block_difficulty.to_string(),
        cumulative_difficulty: meta.cumulative_difficulty.to_string(),
        orphan: meta.orphan,
        block,
    }))
}

#[derive(Deserialize)]
struct TemplateParams {
    wallet: String,
}

#[derive(Serialize)]
struct TemplateResponse {
    /// bincode of the unmined candidate, ready for an external miner
    blob: String,
    mining_hash: String,
    difficulty: String,
}

async fn block_template(
    State(handle): State<NodeHandle>,
    Query(params): Query<TemplateParams>,
) -> Result<Json<TemplateResponse>, ApiError> {
    let wallet = parse_address(&params.wallet)?;
    let (block, difficulty) = loop_gone(handle.block_template(wallet).await)?
        .map_err(ApiError::Unknown)?;
    let blob = bincode::serialize(&block).map_err(|e| ApiError::Unknown(e.to_string()))?;
    Ok(Json(TemplateResponse {
        blob: hex::encode(blob),
        mining_hash: hex::encode(block.mining_hash()),
        difficulty: difficulty.to_string(),
    }))
}

#[derive(Deserialize)]
struct SubmitBlockRequest {
    /// hex bincode, as produced by /block-template (plus the found nonce)
    blob: String,
}

#[derive(Serialize)]
struct SubmitBlockResponse {
    accepted: bool,
    headerhash: String,
}

async fn submit_block(
    State(handle): State<NodeHandle>,
    Json(req): Json<SubmitBlockRequest>,
) -> Result<Json<SubmitBlockResponse>, ApiError> {
    let raw = hex::decode(&req.blob).map_err(|e| ApiError::Unknown(e.to_string()))?;
    let block: Block = bincode::deserialize(&raw).map_err(|e| ApiError::Unknown(e.to_string()))?;
    let headerhash = hex::encode(block.header_hash());
    let accepted = loop_gone(handle.submit_block(block).await)?.map_err(ApiError::Unknown)?;
    Ok(Json(SubmitBlockResponse { accepted, headerhash }))
}

#[derive(Deserialize)]
struct TransferRequest {
    addr_to: String,
    amount: u64,
    fee: u64,
    nonce: u64,
    ots_key: u64,
    /// hex XMSS public key of the sender
    public_key: String,
}

async fn build_transfer(
    Json(req): Json<TransferRequest>,
) -> Result<Json<Transaction>, ApiError> {
    let addr_to = parse_address(&req.addr_to)?;
    let public_key = hex::decode(&req.public_key).map_err(|e| ApiError::Unknown(e.to_string()))?;
    // constructed, never admitted: signing happens wherever the key lives
    let tx = Transaction::Transfer(TransferTx::create(
        addr_to,
        req.amount,
        req.fee,
        req.nonce,
        public_key,
        req.ots_key,
    ));
    Ok(Json(tx))
}

#[derive(Serialize)]
struct SubmitTxResponse {
    txhash: String,
}

async fn submit_transaction(
    State(handle): State<NodeHandle>,
    Json(tx): Json<Transaction>,
) -> Result<Json<SubmitTxResponse>, ApiError> {
    let txhash = loop_gone(handle.submit_transaction(tx).await)?.map_err(ApiError::Unknown)?;
    Ok(Json(SubmitTxResponse { txhash: hex::encode(txhash) }))
}
