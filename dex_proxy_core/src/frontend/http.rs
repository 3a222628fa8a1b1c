//! The REST surface (spec §6). Handlers are thin: parse, call the DEX
//! Core, map the result straight into a response. All domain errors flow
//! through `DexProxyError`'s `IntoResponse` impl.

use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::app::{CancelAllResult, DexProxyApp};
use crate::errors::{DexProxyError, DexProxyResult};
use crate::model::{OrderType, Request, RequestKind, Side, WrapDirection};

#[derive(Debug, Deserialize)]
pub struct InsertOrderBody {
    pub venue: String,
    pub client_request_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

pub async fn insert_order(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Json(body): Json<InsertOrderBody>,
) -> DexProxyResult<Response> {
    let outcome = app
        .submit_order(
            &body.venue,
            body.client_request_id,
            body.symbol,
            body.side,
            body.order_type,
            body.price,
            body.quantity,
            body.gas_price_wei,
        )
        .await?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderQuery {
    pub venue: String,
    pub client_order_id: String,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

#[derive(Debug, Serialize)]
pub struct CancelOrderResponse {
    pub client_order_id: String,
}

pub async fn cancel_order(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Query(query): Query<CancelOrderQuery>,
) -> DexProxyResult<Response> {
    app.cancel_request(&query.venue, &query.client_order_id, query.gas_price_wei).await?;

    Ok((
        StatusCode::OK,
        Json(CancelOrderResponse {
            client_order_id: query.client_order_id,
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CancelAllOrdersQuery {
    pub venue: String,
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub fast_priority_gas_price_wei: Option<u128>,
}

pub async fn cancel_all_orders(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Query(query): Query<CancelAllOrdersQuery>,
) -> DexProxyResult<Json<CancelAllResult>> {
    let kind = query
        .request_type
        .as_deref()
        .map(str::parse::<RequestKind>)
        .transpose()?
        .unwrap_or(RequestKind::Order);

    let result = app.cancel_all(&query.venue, kind, query.fast_priority_gas_price_wei).await;

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ClientRequestIdQuery {
    pub client_request_id: String,
}

pub async fn get_order(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Query(query): Query<ClientRequestIdQuery>,
) -> DexProxyResult<Json<Request>> {
    Ok(Json(app.get_request_status(&query.client_request_id)?))
}

/// Default/maximum page size for list endpoints (spec supplement: list
/// endpoints carry a `next_page` cursor, mirroring the original schemas'
/// paging convention).
const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RequestTypeQuery {
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RequestPage {
    pub items: Vec<Request>,
    pub next_page: Option<String>,
}

fn paginate(app: &DexProxyApp, query: &RequestTypeQuery) -> DexProxyResult<RequestPage> {
    let kind = query
        .request_type
        .as_deref()
        .map(str::parse::<RequestKind>)
        .transpose()?
        .unwrap_or(RequestKind::Order);

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(DEFAULT_PAGE_LIMIT);
    let (items, next_page) = app.get_all_open_requests_page(kind, query.page.as_deref(), limit);

    Ok(RequestPage { items, next_page })
}

pub async fn get_orders(Extension(app): Extension<Arc<DexProxyApp>>, Query(query): Query<RequestTypeQuery>) -> DexProxyResult<Json<RequestPage>> {
    Ok(Json(paginate(&app, &query)?))
}

#[derive(Debug, Deserialize)]
pub struct ApproveTokenBody {
    pub venue: String,
    pub client_request_id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub approve_contract_address: String,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

pub async fn approve_token(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Json(body): Json<ApproveTokenBody>,
) -> DexProxyResult<Response> {
    let outcome = app
        .submit_approval(
            &body.venue,
            body.client_request_id,
            body.symbol,
            body.amount,
            body.approve_contract_address,
            body.gas_price_wei,
        )
        .await?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub venue: String,
    pub client_request_id: String,
    pub symbol: String,
    pub amount: Decimal,
    #[serde(default)]
    pub address_to: Option<String>,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

async fn submit_transfer_like(app: Arc<DexProxyApp>, body: TransferBody, request_path: &'static str) -> DexProxyResult<Response> {
    let outcome = app
        .submit_transfer(
            &body.venue,
            body.client_request_id,
            body.symbol,
            body.amount,
            body.address_to,
            request_path.to_string(),
            body.gas_price_wei,
        )
        .await?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}

pub async fn transfer_token(Extension(app): Extension<Arc<DexProxyApp>>, Json(body): Json<TransferBody>) -> DexProxyResult<Response> {
    submit_transfer_like(app, body, "transfer").await
}

pub async fn withdraw(Extension(app): Extension<Arc<DexProxyApp>>, Json(body): Json<TransferBody>) -> DexProxyResult<Response> {
    submit_transfer_like(app, body, "withdraw").await
}

pub async fn deposit(Extension(app): Extension<Arc<DexProxyApp>>, Json(body): Json<TransferBody>) -> DexProxyResult<Response> {
    submit_transfer_like(app, body, "deposit").await
}

#[derive(Debug, Deserialize)]
pub struct WrapUnwrapBody {
    pub venue: String,
    pub client_request_id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub direction: WrapDirection,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

pub async fn wrap_unwrap_eth(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Json(body): Json<WrapUnwrapBody>,
) -> DexProxyResult<Response> {
    let outcome = app
        .submit_wrap_unwrap(&body.venue, body.client_request_id, body.symbol, body.amount, body.direction, body.gas_price_wei)
        .await?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BridgeBody {
    pub venue: String,
    pub client_request_id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub source_chain: String,
    pub destination_chain: String,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

pub async fn bridge(Extension(app): Extension<Arc<DexProxyApp>>, Json(body): Json<BridgeBody>) -> DexProxyResult<Response> {
    let outcome = app
        .submit_bridge(
            &body.venue,
            body.client_request_id,
            body.symbol,
            body.amount,
            body.source_chain,
            body.destination_chain,
            body.gas_price_wei,
        )
        .await?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AmendRequestBody {
    pub venue: String,
    pub client_request_id: String,
    pub gas_price_wei: u128,
}

pub async fn amend_request(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Json(body): Json<AmendRequestBody>,
) -> DexProxyResult<Response> {
    let outcome = app.amend_request(&body.venue, &body.client_request_id, body.gas_price_wei).await?;
    Ok((StatusCode::OK, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CancelRequestBody {
    pub venue: String,
    pub client_request_id: String,
    #[serde(default)]
    pub gas_price_wei: Option<u128>,
}

pub async fn cancel_request(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Json(body): Json<CancelRequestBody>,
) -> DexProxyResult<Response> {
    let outcome = app.cancel_request(&body.venue, &body.client_request_id, body.gas_price_wei).await?;
    Ok((StatusCode::OK, Json(outcome)).into_response())
}

pub async fn get_request_status(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Query(query): Query<ClientRequestIdQuery>,
) -> DexProxyResult<Json<Request>> {
    Ok(Json(app.get_request_status(&query.client_request_id)?))
}

pub async fn get_all_open_requests(
    Extension(app): Extension<Arc<DexProxyApp>>,
    Query(query): Query<RequestTypeQuery>,
) -> DexProxyResult<Json<RequestPage>> {
    Ok(Json(paginate(&app, &query)?))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub async fn handler_404() -> Response {
    DexProxyError::BadRequest("route not found".into()).into_response()
}
