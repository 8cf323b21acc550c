// HTTP control surface
//
// A thin warp layer over `GatewayHandle`. Every route requires
// `Authorization: Bearer <api_token>`.

use lockbridge_core::{
    GatewayError, GatewayHandle, LogEntry, Message, PeripheralId, ProcessState, Secrets,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::{Filter, Reply};

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    name: Option<String>,
    value: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardRequest {
    card_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataRequest {
    peripheral_id: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeripheralQuery {
    peripheral_id: String,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: i64,
}

#[derive(Serialize)]
struct QueuedResponse {
    queued: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CardResponse {
    card_id: String,
    existed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeripheralStateResponse {
    peripheral_id: String,
    state: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    sequence_id: u64,
    raw_text: String,
    process_state: ProcessState,
    logged: bool,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            sequence_id: message.sequence_id,
            raw_text: message.raw_text,
            process_state: message.process_state,
            logged: message.logged,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEntryResponse {
    peripheral_id: String,
    timestamp_ms: u64,
    text: String,
}

impl From<LogEntry> for LogEntryResponse {
    fn from(entry: LogEntry) -> Self {
        Self {
            peripheral_id: entry.peripheral.to_string(),
            timestamp_ms: entry.timestamp_ms,
            text: entry.text,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

const DEFAULT_LOG_LIMIT: usize = 100;

// ============================================================================
// SERVER START
// ============================================================================

fn with_auth(
    secrets: Arc<Secrets>,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |header: Option<String>| {
            let secrets = secrets.clone();
            async move {
                match header.as_deref().and_then(|h| h.strip_prefix("Bearer ")) {
                    Some(token) if !secrets.api_token.is_empty() && token == secrets.api_token => {
                        Ok(())
                    }
                    _ => Err(warp::reject::custom(Unauthorized)),
                }
            }
        })
        .untuple_one()
}

pub fn start(handle: GatewayHandle, secrets: Arc<Secrets>, addr: SocketAddr) -> JoinHandle<()> {
    let with_handle = warp::any().map(move || handle.clone());
    let api = with_auth(secrets).and(with_handle);

    let toggle_route = warp::path!("lock")
        .and(warp::post())
        .and(api.clone())
        .and_then(handle_toggle_lock)
        .boxed();

    let status_route = warp::path!("lock" / "status")
        .and(warp::get())
        .and(api.clone())
        .and_then(handle_lock_status)
        .boxed();

    let get_settings_route = warp::path!("lock" / "settings")
        .and(warp::get())
        .and(api.clone())
        .and_then(handle_get_settings)
        .boxed();

    let send_settings_route = warp::path!("lock" / "settings")
        .and(warp::post())
        .and(api.clone())
        .and(warp::body::json())
        .and_then(handle_send_settings)
        .boxed();

    let reboot_lock_route = warp::path!("lock" / "reboot")
        .and(warp::post())
        .and(api.clone())
        .and_then(handle_reboot_lock)
        .boxed();

    let reboot_rfid_route = warp::path!("rfid" / "reboot")
        .and(warp::post())
        .and(api.clone())
        .and_then(handle_reboot_rfid)
        .boxed();

    let list_cards_route = warp::path!("cards")
        .and(warp::get())
        .and(api.clone())
        .and_then(handle_list_cards)
        .boxed();

    let add_card_route = warp::path!("cards")
        .and(warp::post())
        .and(api.clone())
        .and(warp::body::json())
        .and_then(handle_add_card)
        .boxed();

    let remove_card_route = warp::path!("cards")
        .and(warp::delete())
        .and(api.clone())
        .and(warp::body::json())
        .and_then(handle_remove_card)
        .boxed();

    let send_data_route = warp::path!("peripheral" / "data")
        .and(warp::post())
        .and(api.clone())
        .and(warp::body::json())
        .and_then(handle_send_data)
        .boxed();

    let history_route = warp::path!("peripheral" / "history")
        .and(warp::get())
        .and(api.clone())
        .and(warp::query::<PeripheralQuery>())
        .and_then(handle_history)
        .boxed();

    let log_route = warp::path!("peripheral" / "log")
        .and(warp::get())
        .and(api.clone())
        .and(warp::query::<PeripheralQuery>())
        .and_then(handle_log)
        .boxed();

    let peripheral_status_route = warp::path!("peripheral" / "status")
        .and(warp::get())
        .and(api)
        .and_then(handle_peripheral_status)
        .boxed();

    let routes = toggle_route
        .or(status_route)
        .or(get_settings_route)
        .or(send_settings_route)
        .or(reboot_lock_route)
        .or(reboot_rfid_route)
        .or(list_cards_route)
        .or(add_card_route)
        .or(remove_card_route)
        .or(send_data_route)
        .or(history_route)
        .or(log_route)
        .or(peripheral_status_route)
        .recover(handle_rejection)
        .boxed();

    tracing::info!("Control surface listening on {}", addr);
    tokio::spawn(async move {
        warp::serve(routes).run(addr).await;
    })
}

// ============================================================================
// REPLIES
// ============================================================================

fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Cancelled { .. }
        | GatewayError::OutboxFull { .. }
        | GatewayError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::UnknownPeripheral(_) | GatewayError::UnknownSetting(_) => {
            StatusCode::NOT_FOUND
        }
        GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        GatewayError::Transport(_) | GatewayError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_reply(status: StatusCode, error: String) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&ErrorResponse { error }), status).into_response()
}

fn reply<T: Serialize>(result: lockbridge_core::Result<T>) -> Result<warp::reply::Response, Infallible> {
    Ok(match result {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(e) => {
            tracing::warn!("Request failed: {}", e);
            error_reply(status_for(&e), e.to_string())
        }
    })
}

async fn handle_rejection(rejection: warp::Rejection) -> Result<warp::reply::Response, Infallible> {
    let (status, message) = if rejection.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "unauthorized".to_string())
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", rejection))
    };
    Ok(error_reply(status, message))
}

// ============================================================================
// API HANDLERS
// ============================================================================

async fn handle_toggle_lock(handle: GatewayHandle) -> Result<warp::reply::Response, Infallible> {
    reply(handle.toggle_lock().await.map(|status| StatusResponse { status }))
}

async fn handle_lock_status(handle: GatewayHandle) -> Result<warp::reply::Response, Infallible> {
    reply(handle.get_lock_status().await.map(|status| StatusResponse { status }))
}

async fn handle_get_settings(handle: GatewayHandle) -> Result<warp::reply::Response, Infallible> {
    reply(handle.get_all_lock_settings().await)
}

async fn handle_send_settings(
    handle: GatewayHandle,
    request: SettingsRequest,
) -> Result<warp::reply::Response, Infallible> {
    reply(
        handle
            .send_peripheral_settings(None, request.name, request.value)
            .await
            .map(|queued| QueuedResponse { queued }),
    )
}

async fn handle_reboot_lock(handle: GatewayHandle) -> Result<warp::reply::Response, Infallible> {
    reply(handle.reboot_lock().await.map(|()| QueuedResponse { queued: 1 }))
}

async fn handle_reboot_rfid(handle: GatewayHandle) -> Result<warp::reply::Response, Infallible> {
    reply(handle.reboot_rfid().await.map(|()| QueuedResponse { queued: 1 }))
}

async fn handle_list_cards(handle: GatewayHandle) -> Result<warp::reply::Response, Infallible> {
    reply(handle.get_keys())
}

async fn handle_add_card(
    handle: GatewayHandle,
    request: CardRequest,
) -> Result<warp::reply::Response, Infallible> {
    reply(handle.add_key(&request.card_id).map(|card_id| CardResponse {
        card_id,
        existed: false,
    }))
}

async fn handle_remove_card(
    handle: GatewayHandle,
    request: CardRequest,
) -> Result<warp::reply::Response, Infallible> {
    reply(handle.remove_key(&request.card_id).map(|existed| CardResponse {
        card_id: request.card_id.trim().to_lowercase(),
        existed,
    }))
}

async fn handle_send_data(
    handle: GatewayHandle,
    request: DataRequest,
) -> Result<warp::reply::Response, Infallible> {
    reply(
        handle
            .send_data(PeripheralId::new(&request.peripheral_id), request.data)
            .await
            .map(|()| QueuedResponse { queued: 1 }),
    )
}

async fn handle_history(
    handle: GatewayHandle,
    query: PeripheralQuery,
) -> Result<warp::reply::Response, Infallible> {
    reply(
        handle
            .get_peripheral_history(PeripheralId::new(&query.peripheral_id))
            .await
            .map(|history| {
                history
                    .into_iter()
                    .map(MessageResponse::from)
                    .collect::<Vec<_>>()
            }),
    )
}

async fn handle_log(
    handle: GatewayHandle,
    query: PeripheralQuery,
) -> Result<warp::reply::Response, Infallible> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    reply(
        handle
            .get_peripheral_log(&PeripheralId::new(&query.peripheral_id), limit)
            .map(|entries| {
                entries
                    .into_iter()
                    .map(LogEntryResponse::from)
                    .collect::<Vec<_>>()
            }),
    )
}

async fn handle_peripheral_status(
    handle: GatewayHandle,
) -> Result<warp::reply::Response, Infallible> {
    reply(handle.connection_states().await.map(|states| {
        states
            .into_iter()
            .map(|(id, state)| PeripheralStateResponse {
                peripheral_id: id.to_string(),
                state: state.to_string(),
            })
            .collect::<Vec<_>>()
    }))
}
