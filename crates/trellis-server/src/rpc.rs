//! Control-plane RPC surface
//!
//! One POST route per operation under `/api/v1`. Handlers validate against
//! the registry and answer with the shared message types; protocol errors
//! map to stable error codes in the [`ErrorBody`] envelope.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use trellis_overlay::{subnets, OverlayError};
use trellis_proto::{codes, rpc::*, Node, Peer, Route};

use crate::config::{Config, NODE_HEARTBEAT_EXPIRY};
use crate::error::ServerError;
use crate::registry::{now_secs, Registry};

/// Shared state of the RPC handlers
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub registry: Arc<Registry>,
}

/// Build the RPC router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/join", post(join))
        .route("/api/v1/connect", post(connect))
        .route("/api/v1/nodes", post(nodes))
        .route("/api/v1/peers", post(peers))
        .route("/api/v1/peers/authorize", post(authorize_peer))
        .route("/api/v1/peers/deauthorize", post(deauthorize_peer))
        .route("/api/v1/peers/authorized", post(authorized_peers))
        .route("/api/v1/routes", post(routes))
        .route("/api/v1/routes/create", post(create_route))
        .route("/api/v1/routes/delete", post(delete_route))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error wrapper mapping [`ServerError`] onto the wire envelope
pub struct ApiError(ServerError);

impl<E: Into<ServerError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            ServerError::InvalidAuth => (StatusCode::UNAUTHORIZED, codes::INVALID_AUTH),
            ServerError::NoMaster => (StatusCode::SERVICE_UNAVAILABLE, codes::NO_PRIMARY),
            ServerError::AccessDenied(_) => (StatusCode::FORBIDDEN, codes::ACCESS_DENIED),
            ServerError::RouteExists(_) => (StatusCode::CONFLICT, codes::ROUTE_EXISTS),
            ServerError::NodeNotFound(_) => (StatusCode::NOT_FOUND, codes::NODE_NOT_FOUND),
            ServerError::Overlay(OverlayError::Exhausted(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, codes::EXHAUSTED)
            }
            ServerError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, codes::KV_UNAVAILABLE),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorBody {
            code: code.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type HandlerResult<T> = std::result::Result<Json<T>, ApiError>;

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

// ----------------------------------------------------------------------
// Join / Connect
// ----------------------------------------------------------------------

async fn join(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> HandlerResult<JoinResponse> {
    debug!(id = %req.id, "join request");

    let key = state
        .registry
        .cluster_key()
        .await?
        .ok_or(ServerError::NoMaster)?;
    if req.cluster_key != key {
        return Err(ServerError::InvalidAuth.into());
    }

    let master = state.registry.master().await?.ok_or(ServerError::NoMaster)?;

    let subnet = state
        .registry
        .ensure_node_subnet(&req.id, state.cfg.node_network)
        .await?;

    let node = match state.registry.node(&req.id).await? {
        Some(node) => node,
        None => {
            let key_pair = state.registry.get_or_create_keypair(&req.id).await?;
            let node = Node {
                id: req.id.clone(),
                name: req.name.clone(),
                addr: req.addr.clone(),
                key_pair,
                endpoint_ip: req.endpoint_ip.clone(),
                endpoint_port: req.endpoint_port,
                gateway_ip: subnets::gateway_ip(subnet)?.to_string(),
                interface_name: req.interface_name.clone(),
                updated_at: now_secs(),
            };
            state.registry.put_node(&node, NODE_HEARTBEAT_EXPIRY).await?;

            // publish the joiner's peer record so existing members pick
            // it up on their next updater tick
            let endpoint = format!("{}:{}", req.endpoint_ip, req.endpoint_port);
            upsert_node_peer(&state.registry, &node, &endpoint, subnet).await?;
            info!(id = %node.id, subnet = %subnet, "node joined");
            node
        }
    };

    let peers = state.registry.peers().await?;
    Ok(Json(JoinResponse {
        master,
        node,
        peers,
    }))
}

async fn upsert_node_peer(
    registry: &Registry,
    node: &Node,
    endpoint: &str,
    subnet: ipnet::Ipv4Net,
) -> Result<(), ServerError> {
    let mut allowed_ips = vec![subnet.to_string()];
    for route in registry.routes().await? {
        if route.node_id == node.id {
            allowed_ips.push(route.network);
        }
    }
    registry
        .put_peer(&Peer {
            id: node.id.clone(),
            name: node.name.clone(),
            key_pair: node.key_pair.clone(),
            allowed_ips,
            endpoint: endpoint.to_string(),
            peer_ip: String::new(),
        })
        .await?;
    Ok(())
}

async fn connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> HandlerResult<ConnectResponse> {
    debug!(id = %req.id, "connect request");

    if !state.registry.is_authorized(&req.id).await? {
        return Err(ServerError::AccessDenied(req.id).into());
    }

    let key_pair = state.registry.get_or_create_keypair(&req.id).await?;
    let ip = state
        .registry
        .ensure_peer_ip(&req.id, state.cfg.peer_network)
        .await?;

    state
        .registry
        .put_peer(&Peer {
            id: req.id.clone(),
            name: req.name.clone(),
            key_pair: key_pair.clone(),
            allowed_ips: vec![format!("{ip}/32")],
            endpoint: String::new(),
            peer_ip: ip.to_string(),
        })
        .await?;

    let peers = state
        .registry
        .peers()
        .await?
        .into_iter()
        .filter(|p| p.id != req.id)
        .collect();
    let dns = state
        .registry
        .nodes()
        .await?
        .into_iter()
        .map(|n| n.gateway_ip)
        .collect();

    Ok(Json(ConnectResponse {
        key_pair,
        address: format!("{}/{}", ip, state.cfg.peer_network.prefix_len()),
        peers,
        dns,
    }))
}

// ----------------------------------------------------------------------
// Peer authorisation
// ----------------------------------------------------------------------

async fn authorize_peer(
    State(state): State<AppState>,
    Json(req): Json<AuthorizePeerRequest>,
) -> HandlerResult<serde_json::Value> {
    info!(id = %req.id, "authorizing peer");
    state.registry.authorize_peer(&req.id).await?;
    Ok(ok())
}

async fn deauthorize_peer(
    State(state): State<AppState>,
    Json(req): Json<DeauthorizePeerRequest>,
) -> HandlerResult<serde_json::Value> {
    info!(id = %req.id, "deauthorizing peer");
    state.registry.deauthorize_peer(&req.id).await?;
    state.registry.delete_peer(&req.id).await?;
    state.registry.release_peer_ip(&req.id).await?;
    state.registry.publish_restart_tunnel().await?;
    Ok(ok())
}

async fn authorized_peers(
    State(state): State<AppState>,
) -> HandlerResult<AuthorizedPeersResponse> {
    let ids = state.registry.authorized_peers().await?;
    Ok(Json(AuthorizedPeersResponse { ids }))
}

// ----------------------------------------------------------------------
// Listings
// ----------------------------------------------------------------------

async fn nodes(State(state): State<AppState>) -> HandlerResult<NodesResponse> {
    let nodes = state.registry.nodes().await?;
    Ok(Json(NodesResponse { nodes }))
}

async fn peers(State(state): State<AppState>) -> HandlerResult<PeersResponse> {
    let peers = state.registry.peers().await?;
    Ok(Json(PeersResponse { peers }))
}

// ----------------------------------------------------------------------
// Routes
// ----------------------------------------------------------------------

async fn routes(State(state): State<AppState>) -> HandlerResult<RoutesResponse> {
    let routes = state.registry.routes().await?;
    Ok(Json(RoutesResponse { routes }))
}

async fn create_route(
    State(state): State<AppState>,
    Json(req): Json<CreateRouteRequest>,
) -> HandlerResult<serde_json::Value> {
    if state.registry.route(&req.network).await?.is_some() {
        return Err(ServerError::RouteExists(req.network).into());
    }
    if state.registry.node(&req.node_id).await?.is_none() {
        return Err(ServerError::NodeNotFound(req.node_id).into());
    }

    info!(node = %req.node_id, network = %req.network, "creating route");
    state
        .registry
        .put_route(&Route {
            node_id: req.node_id,
            network: req.network,
        })
        .await?;
    Ok(ok())
}

async fn delete_route(
    State(state): State<AppState>,
    Json(req): Json<DeleteRouteRequest>,
) -> HandlerResult<serde_json::Value> {
    info!(network = %req.network, "deleting route");
    state.registry.delete_route(&req.network).await?;
    Ok(ok())
}
