use std::sync::Arc;

use axum::{
    extract::{Path, State as AxumState},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use squares_execution::{BoardStore, Engine, Wallet};
use squares_types::{
    Board, ClaimSquareRequest, CreateBoard, EngineError, ErrorResponse, Game, GameUpdateReport,
    OperatorItem, Period, ReconcileReport, Square, WinRecord, WinnerRecord, WinnerSummary,
};
use tracing::warn;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const ACTOR_HEADER: &str = "x-actor";

pub struct AppState<S, W> {
    pub engine: Arc<Engine<S, W>>,
    admin_token: Option<Arc<str>>,
}

impl<S, W> Clone for AppState<S, W> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            admin_token: self.admin_token.clone(),
        }
    }
}

impl<S, W> AppState<S, W> {
    pub fn new(engine: Arc<Engine<S, W>>, admin_token: Option<String>) -> Self {
        Self {
            engine,
            admin_token: admin_token.map(Arc::from),
        }
    }

    /// Checks `x-admin-token`. With no token configured every admin call is refused.
    fn authorize(&self, headers: &HeaderMap) -> Result<String, ApiError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Err(ApiError::Unauthorized);
        };
        let provided = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected) {
            return Err(ApiError::Unauthorized);
        }
        let actor = headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("admin");
        Ok(actor.to_string())
    }
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    Unauthorized,
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        ApiError::Engine(value)
    }
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Conflict { .. } => StatusCode::CONFLICT,
        EngineError::InvalidState { .. } => StatusCode::CONFLICT,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::AlreadyExists { .. } => StatusCode::CONFLICT,
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::ExternalFeedInconsistency { .. } => StatusCode::ACCEPTED,
        EngineError::Wallet(_) => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Engine(err) => {
                let status = engine_status(&err);
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (status, err.code().to_string(), err.to_string())
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT".to_string(), message)
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED".to_string(),
                "missing or invalid admin token".to_string(),
            ),
        };
        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WinnerResponse {
    board_id: String,
    period: Period,
    record: WinnerRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<WinnerSummary>,
}

pub fn router<S: BoardStore, W: Wallet>(state: AppState<S, W>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/boards", post(create_board::<S, W>))
        .route("/boards/:id", get(get_board::<S, W>))
        .route(
            "/boards/:id/squares",
            get(list_squares::<S, W>).post(claim_square::<S, W>),
        )
        .route("/boards/:id/winners/:period", get(get_winner::<S, W>))
        .route("/boards/:id/fill", post(force_fill::<S, W>))
        .route("/boards/:id/reconcile/:period", post(reconcile::<S, W>))
        .route("/games/:id", get(get_game::<S, W>).put(put_game::<S, W>))
        .route("/users/:id/wins", get(user_wins::<S, W>))
        .route("/operator/queue", get(operator_queue::<S, W>))
        .with_state(state)
}

fn parse_period(raw: &str) -> ApiResult<Period> {
    raw.parse::<Period>().map_err(ApiError::BadRequest)
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { ok: true })
}

async fn create_board<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    headers: HeaderMap,
    Json(request): Json<CreateBoard>,
) -> ApiResult<(StatusCode, Json<Board>)> {
    state.authorize(&headers)?;
    let board = state.engine.create_board(request)?;
    Ok((StatusCode::CREATED, Json(board)))
}

async fn get_board<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Board>> {
    Ok(Json(state.engine.board(&id)?))
}

async fn list_squares<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Square>>> {
    Ok(Json(state.engine.squares(&id)?))
}

async fn claim_square<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path(id): Path<String>,
    Json(request): Json<ClaimSquareRequest>,
) -> ApiResult<(StatusCode, Json<Square>)> {
    let square = state
        .engine
        .claim_square(&id, request.index, &request.owner_id)?;
    Ok((StatusCode::CREATED, Json(square)))
}

async fn get_winner<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path((id, period)): Path<(String, String)>,
) -> ApiResult<Json<WinnerResponse>> {
    let period = parse_period(&period)?;
    let record = state.engine.winner(&id, period)?;
    let summary = state.engine.winner_summary(&id, period)?;
    Ok(Json(WinnerResponse {
        board_id: id,
        period,
        record,
        summary,
    }))
}

async fn force_fill<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Board>> {
    let actor = state.authorize(&headers)?;
    Ok(Json(state.engine.force_fill(&id, &actor)?))
}

async fn reconcile<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    headers: HeaderMap,
    Path((id, period)): Path<(String, String)>,
) -> ApiResult<Json<ReconcileReport>> {
    let actor = state.authorize(&headers)?;
    let period = parse_period(&period)?;
    Ok(Json(state.engine.reconcile(&id, period, &actor).await?))
}

async fn put_game<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path(id): Path<String>,
    Json(mut game): Json<Game>,
) -> ApiResult<Json<GameUpdateReport>> {
    if game.id.is_empty() {
        game.id = id;
    } else if game.id != id {
        return Err(ApiError::BadRequest(format!(
            "game id {} does not match path {id}",
            game.id
        )));
    }
    Ok(Json(state.engine.upsert_game(game).await?))
}

async fn get_game<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Game>> {
    Ok(Json(state.engine.game(&id)?))
}

async fn user_wins<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WinRecord>>> {
    Ok(Json(state.engine.wins_for(&id)?))
}

async fn operator_queue<S: BoardStore, W: Wallet>(
    AxumState(state): AxumState<AppState<S, W>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<OperatorItem>>> {
    state.authorize(&headers)?;
    Ok(Json(state.engine.operator_queue()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use squares_execution::mocks::{test_engine, MemoryWallet};
    use squares_execution::Memory;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn app() -> (Router, Arc<Engine<Memory, MemoryWallet>>) {
        let (engine, _clock) = test_engine(9);
        let engine = Arc::new(engine);
        let router = router(AppState::new(engine.clone(), Some(TOKEN.to_string())));
        (router, engine)
    }

    async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
        admin: bool,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if admin {
            request = request.header(ADMIN_TOKEN_HEADER, TOKEN);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn healthz_ok() {
        let (router, _engine) = app();
        let (status, body) = call(&router, Method::GET, "/healthz", None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn admin_routes_need_token() {
        let (router, _engine) = app();
        let (status, body) = call(
            &router,
            Method::POST,
            "/boards",
            Some(json!({ "id": "b1", "gameId": "g1", "entryFee": 500 })),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, _) = call(&router, Method::GET, "/operator/queue", None, false).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn board_claim_and_conflict() {
        let (router, _engine) = app();
        let (status, _) = call(
            &router,
            Method::PUT,
            "/games/g1",
            Some(json!({ "quarter": 0 })),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, board) = call(
            &router,
            Method::POST,
            "/boards",
            Some(json!({ "id": "b1", "gameId": "g1", "entryFee": 500 })),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(board["status"], "open");
        assert_eq!(board["payoutPerPeriod"], 10_000);

        let claim = json!({ "index": 42, "ownerId": "alice" });
        let (status, square) = call(
            &router,
            Method::POST,
            "/boards/b1/squares",
            Some(claim.clone()),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(square["owner"], "alice");

        let (status, body) =
            call(&router, Method::POST, "/boards/b1/squares", Some(claim), false).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SQUARE_TAKEN");

        let (status, body) = call(
            &router,
            Method::POST,
            "/boards/b1/squares",
            Some(json!({ "index": 100, "ownerId": "bob" })),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_INPUT");

        let (status, body) = call(&router, Method::GET, "/boards/nope", None, false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn free_board_full_flow_over_http() {
        let (router, engine) = app();
        call(&router, Method::PUT, "/games/g1", Some(json!({})), false).await;
        call(
            &router,
            Method::POST,
            "/boards",
            Some(json!({ "id": "b1", "gameId": "g1", "entryFee": 0, "sweepstakesPrize": 2500 })),
            true,
        )
        .await;
        for index in 0..10 {
            call(
                &router,
                Method::POST,
                "/boards/b1/squares",
                Some(json!({ "index": index, "ownerId": format!("user{index}") })),
                false,
            )
            .await;
        }
        let (status, board) = call(&router, Method::POST, "/boards/b1/fill", None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board["status"], "full");

        let (status, report) = call(
            &router,
            Method::PUT,
            "/games/g1",
            Some(json!({
                "id": "g1",
                "isLive": true,
                "quarter": 2,
                "periodScores": { "q1": { "home": 7, "away": 3 } }
            })),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["activated"], 1);
        assert_eq!(report["resolved"], 1);

        let (status, winner) =
            call(&router, Method::GET, "/boards/b1/winners/q1", None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(winner["record"]["assigned"], true);
        assert_eq!(winner["record"]["paid"], true);
        assert_eq!(
            winner["summary"]["winningSquareValue"],
            winner["record"]["winningSquareValue"]
        );

        let (status, report) = call(
            &router,
            Method::POST,
            "/boards/b1/reconcile/q1",
            None,
            true,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["assignedNow"], false);
        assert_eq!(report["paidNow"], false);

        let (status, _) =
            call(&router, Method::GET, "/boards/b1/winners/q9", None, false).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let audit = engine.store().audit_log("b1").unwrap();
        assert_eq!(audit.len(), 2);
    }

    #[tokio::test]
    async fn game_id_mismatch_rejected() {
        let (router, _engine) = app();
        let (status, _) = call(
            &router,
            Method::PUT,
            "/games/g1",
            Some(json!({ "id": "g2" })),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
