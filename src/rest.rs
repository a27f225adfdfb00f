//! A HTTP API for the clients and the operator of the coordinator.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use warp::{
    http::StatusCode,
    reply::{self, Reply},
    Filter,
};

use crate::{
    channel::BroadcastChannel,
    messages::TaskRequest,
    orchestrator::{MessageError, OrchestratorError, TaskOrchestrator},
    settings::ApiSettings,
    storage::{AggregationError, ArrayStore},
};

#[derive(Deserialize, Serialize)]
struct BroadcastQuery {
    #[serde(default)]
    since: u64,
}

/// Starts a HTTP server at the given address.
///
/// * `api_settings`: address of the server.
/// * `orchestrator`: the orchestrator handling the clients and the tasks.
/// * `channel`: the log of the broadcasts polled by the clients.
///
/// # Errors
/// Fails if the server cannot be bound to the address.
pub async fn serve<S>(
    api_settings: ApiSettings,
    orchestrator: TaskOrchestrator<S>,
    channel: Arc<BroadcastChannel>,
) -> Result<(), RestError>
where
    S: ArrayStore,
{
    let routes = routes(orchestrator, channel);
    let (address, server) = warp::serve(routes).try_bind_ephemeral(api_settings.bind_address)?;
    info!("listening on {}", address);
    server.await;
    Ok(())
}

/// The routes of the API.
pub fn routes<S>(
    orchestrator: TaskOrchestrator<S>,
    channel: Arc<BroadcastChannel>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone
where
    S: ArrayStore,
{
    let register = warp::path!("clients" / String)
        .and(warp::post())
        .and(warp::addr::remote())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_register);

    let clients = warp::path!("clients")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_clients);

    let message = warp::path!("message" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_message);

    let tasks = warp::path!("tasks")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_orchestrator(orchestrator))
        .and_then(handle_task);

    let broadcasts = warp::path!("broadcasts")
        .and(warp::get())
        .and(warp::query::<BroadcastQuery>())
        .and(with_channel(channel))
        .and_then(handle_broadcasts);

    register
        .or(clients)
        .or(message)
        .or(tasks)
        .or(broadcasts)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Registers a client.
async fn handle_register<S: ArrayStore>(
    name: String,
    address: Option<SocketAddr>,
    orchestrator: TaskOrchestrator<S>,
) -> Result<impl warp::Reply, Infallible> {
    orchestrator.register_client(&name, address.map(|address| address.to_string()));
    Ok(StatusCode::OK)
}

/// Responds with the registered clients.
async fn handle_clients<S: ArrayStore>(
    orchestrator: TaskOrchestrator<S>,
) -> Result<impl warp::Reply, Infallible> {
    Ok(reply::json(&orchestrator.context().registry.list_clients()))
}

/// Handles and responds to a client message.
async fn handle_message<S: ArrayStore>(
    name: String,
    body: Bytes,
    orchestrator: TaskOrchestrator<S>,
) -> Result<impl warp::Reply, Infallible> {
    let status = match orchestrator.handle_message(&name, &body).await {
        Ok(()) => StatusCode::OK,
        Err(MessageError::UnknownClient(_)) => StatusCode::FORBIDDEN,
        Err(MessageError::Malformed(_)) => StatusCode::BAD_REQUEST,
        Err(MessageError::NoActiveTask)
        | Err(MessageError::UnexpectedTask { .. })
        | Err(MessageError::NotParticipating { .. })
        | Err(MessageError::Aggregation(AggregationError::AlreadyFinalized(_))) => {
            StatusCode::CONFLICT
        }
        Err(err) => {
            error!("failed to handle message of {}: {}", name, err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    Ok(status)
}

/// Starts a task and supervises it in the background.
async fn handle_task<S: ArrayStore>(
    request: TaskRequest,
    orchestrator: TaskOrchestrator<S>,
) -> Result<impl warp::Reply, Infallible> {
    match orchestrator.start_task(request).await {
        Ok(run) => {
            let id = run.id().to_string();
            let supervisor = orchestrator.clone();
            tokio::spawn(async move {
                if let Err(err) = supervisor.supervise(run).await {
                    warn!("{}", err);
                }
            });
            Ok(reply::with_status(id, StatusCode::ACCEPTED))
        }
        Err(err) => {
            warn!("failed to start task: {}", err);
            let status = match err {
                OrchestratorError::TaskActive(_) => StatusCode::CONFLICT,
                OrchestratorError::InvalidThresholds(_) | OrchestratorError::MissingStatistics => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Ok(reply::with_status(err.to_string(), status))
        }
    }
}

/// Responds with the bincode encoded broadcasts sent after the given sequence number.
async fn handle_broadcasts(
    query: BroadcastQuery,
    channel: Arc<BroadcastChannel>,
) -> Result<impl warp::Reply, Infallible> {
    let broadcasts = channel.since(query.since);
    Ok(match bincode::serialize(&broadcasts) {
        Ok(bytes) => reply::with_status(
            reply::with_header(bytes, "Content-Type", "application/octet-stream"),
            StatusCode::OK,
        )
        .into_response(),
        Err(err) => {
            warn!("failed to encode broadcasts: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    })
}

/// Converts a task orchestrator into a `warp` filter.
fn with_orchestrator<S: ArrayStore>(
    orchestrator: TaskOrchestrator<S>,
) -> impl Filter<Extract = (TaskOrchestrator<S>,), Error = Infallible> + Clone {
    warp::any().map(move || orchestrator.clone())
}

/// Converts the broadcast log into a `warp` filter.
fn with_channel(
    channel: Arc<BroadcastChannel>,
) -> impl Filter<Extract = (Arc<BroadcastChannel>,), Error = Infallible> + Clone {
    warp::any().map(move || channel.clone())
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::InvalidQuery>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(reply::with_status(Vec::new(), code))
}

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("the server could not be started: {0}")]
    Bind(#[from] warp::Error),
}
