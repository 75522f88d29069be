use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::domain::{Booking, BookingStatus, CarId, OutboxIntent};
use crate::error::BookingError;
use crate::handlers::{BookingHandler, BookingRequest};
use crate::outbox::OutboxProcessor;
use crate::store::BookingStore;

const DEFAULT_DEAD_LETTER_LIMIT: i64 = 50;

pub struct AppState<S> {
    pub bookings: BookingHandler<S>,
    pub relay: Arc<OutboxProcessor<S>>,
}

impl<S: Clone> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            bookings: self.bookings.clone(),
            relay: self.relay.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookByCarRequest {
    pub client_id: i64,
    pub car_id: i64,
    pub pickup_location_id: i64,
    pub return_location_id: i64,
    pub pickup: DateTime<Utc>,
    #[serde(rename = "return")]
    pub return_time: DateTime<Utc>,
    pub coupon: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookByModelRequest {
    pub client_id: i64,
    pub car_model_id: i64,
    pub pickup_location_id: i64,
    pub return_location_id: i64,
    pub pickup: DateTime<Utc>,
    #[serde(rename = "return")]
    pub return_time: DateTime<Utc>,
    pub coupon: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    pub id: i64,
    pub status: BookingStatus,
    pub total_price_cents: i64,
    pub currency: String,
    pub client_id: i64,
    pub car_id: i64,
    pub pickup_location_id: i64,
    pub return_location_id: i64,
    pub pickup: DateTime<Utc>,
    pub return_time: DateTime<Utc>,
    pub version: i64,
}

impl From<Booking> for BookingResponse {
    fn from(booking: Booking) -> Self {
        Self {
            id: booking.id,
            status: booking.status,
            total_price_cents: booking.total_price_cents,
            currency: booking.currency,
            client_id: booking.client_id,
            car_id: booking.car_id,
            pickup_location_id: booking.pickup_location_id,
            return_location_id: booking.return_location_id,
            pickup: booking.pickup_time,
            return_time: booking.return_time,
            version: booking.version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCarsQuery {
    pub model_id: i64,
    pub location_id: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCarsResponse {
    pub car_ids: Vec<CarId>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<OutboxIntent> for DeadLetterResponse {
    fn from(intent: OutboxIntent) -> Self {
        Self {
            id: intent.id,
            aggregate_type: intent.aggregate_type,
            aggregate_id: intent.aggregate_id,
            event_type: intent.event_type,
            retry_count: intent.retry_count,
            error_message: intent.error_message,
            created_at: intent.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ApiError(BookingError);

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(BookingError::validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(BookingError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            BookingError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            BookingError::BusinessRule(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "BUSINESS_RULE_VIOLATION")
            }
            BookingError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            BookingError::ConcurrencyConflict { .. } => {
                (StatusCode::CONFLICT, "CONCURRENT_MODIFICATION")
            }
            BookingError::LockContended { .. } => (StatusCode::CONFLICT, "RESOURCE_LOCKED"),
            BookingError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            BookingError::Serialization(_) | BookingError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        let body = ErrorResponse {
            code,
            message,
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn create_router<S: BookingStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/bookings/by-car", post(book_by_car::<S>))
        .route("/bookings/by-model", post(book_by_model::<S>))
        .route("/bookings/:id", get(get_booking::<S>))
        .route("/bookings/:id/cancel", post(cancel_booking::<S>))
        .route(
            "/bookings/company/:company_id/active",
            get(active_for_company::<S>),
        )
        .route(
            "/bookings/location/:location_id/active",
            get(active_for_location::<S>),
        )
        .route(
            "/bookings/location/:location_id/period",
            get(location_period::<S>),
        )
        .route("/cars/available", get(available_cars::<S>))
        .route("/outbox/dead-letters", get(dead_letters::<S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn responses(bookings: Vec<Booking>) -> Json<Vec<BookingResponse>> {
    Json(bookings.into_iter().map(BookingResponse::from).collect())
}

pub async fn book_by_car<S: BookingStore>(
    State(state): State<AppState<S>>,
    payload: Result<Json<BookByCarRequest>, JsonRejection>,
) -> ApiResult<BookingResponse> {
    let Json(request) = payload?;
    let booking = state
        .bookings
        .create_by_car(
            BookingRequest {
                client_id: request.client_id,
                pickup_location_id: request.pickup_location_id,
                return_location_id: request.return_location_id,
                pickup: request.pickup,
                return_time: request.return_time,
                coupon: request.coupon,
            },
            request.car_id,
        )
        .await?;
    Ok(Json(booking.into()))
}

pub async fn book_by_model<S: BookingStore>(
    State(state): State<AppState<S>>,
    payload: Result<Json<BookByModelRequest>, JsonRejection>,
) -> ApiResult<BookingResponse> {
    let Json(request) = payload?;
    let booking = state
        .bookings
        .create_by_model(
            BookingRequest {
                client_id: request.client_id,
                pickup_location_id: request.pickup_location_id,
                return_location_id: request.return_location_id,
                pickup: request.pickup,
                return_time: request.return_time,
                coupon: request.coupon,
            },
            request.car_model_id,
        )
        .await?;
    Ok(Json(booking.into()))
}

pub async fn get_booking<S: BookingStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<i64>,
) -> ApiResult<BookingResponse> {
    Ok(Json(state.bookings.get(id).await?.into()))
}

pub async fn cancel_booking<S: BookingStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<i64>,
) -> ApiResult<BookingResponse> {
    Ok(Json(state.bookings.cancel(id).await?.into()))
}

pub async fn active_for_company<S: BookingStore>(
    State(state): State<AppState<S>>,
    Path(company_id): Path<i64>,
) -> ApiResult<Vec<BookingResponse>> {
    Ok(responses(state.bookings.active_for_company(company_id).await?))
}

pub async fn active_for_location<S: BookingStore>(
    State(state): State<AppState<S>>,
    Path(location_id): Path<i64>,
) -> ApiResult<Vec<BookingResponse>> {
    Ok(responses(state.bookings.active_for_location(location_id).await?))
}

pub async fn location_period<S: BookingStore>(
    State(state): State<AppState<S>>,
    Path(location_id): Path<i64>,
    query: Result<Query<PeriodQuery>, QueryRejection>,
) -> ApiResult<Vec<BookingResponse>> {
    let Query(period) = query?;
    Ok(responses(
        state
            .bookings
            .in_period(location_id, period.from, period.to)
            .await?,
    ))
}

pub async fn available_cars<S: BookingStore>(
    State(state): State<AppState<S>>,
    query: Result<Query<AvailableCarsQuery>, QueryRejection>,
) -> ApiResult<AvailableCarsResponse> {
    let Query(query) = query?;
    let car_ids = state
        .bookings
        .available_cars(
            query.model_id,
            query.location_id,
            query.from,
            query.to,
            query.limit,
        )
        .await?;
    Ok(Json(AvailableCarsResponse { car_ids }))
}

pub async fn dead_letters<S: BookingStore>(
    State(state): State<AppState<S>>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<DeadLetterResponse>> {
    let Query(LimitQuery { limit }) = query?;
    let intents = state
        .relay
        .dead_letters(limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT))
        .await?;
    Ok(Json(intents.into_iter().map(DeadLetterResponse::from).collect()))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{IntentDispatcher, RelayConfig};
    use crate::pricing::NoPromotions;
    use crate::publisher::LogPublisher;
    use crate::retry::RetryPolicy;
    use crate::saga::SagaManager;
    use crate::store::memory::CarSeed;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use payment_service::{PaymentSimulator, SimulatorConfig};
    use rstest::rstest;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: MemoryStore,
        client: i64,
        location: i64,
        car: i64,
    }

    fn app() -> TestApp {
        let store = MemoryStore::new(Duration::from_millis(50));
        let company = store.add_company();
        let location = store.add_location(company);
        let client = store.add_client();
        let car = store.add_car(CarSeed {
            company_id: company,
            model_id: 3,
            location_id: location,
            plate_number: "API-1".to_string(),
            daily_price_cents: 6_000,
        });

        let saga = SagaManager::new(store.clone(), RetryPolicy::default());
        let dispatcher = IntentDispatcher::new(
            saga.clone(),
            Arc::new(PaymentSimulator::new(SimulatorConfig::default())),
            Arc::new(LogPublisher),
        );
        let state = AppState {
            bookings: BookingHandler::new(store.clone(), saga, Arc::new(NoPromotions), 10),
            relay: Arc::new(OutboxProcessor::new(
                store.clone(),
                dispatcher,
                RelayConfig::default(),
            )),
        };
        TestApp {
            router: create_router(state),
            store,
            client,
            location,
            car,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn by_car(app: &TestApp, pickup: &str, ret: &str) -> Value {
        json!({
            "clientId": app.client,
            "carId": app.car,
            "pickupLocationId": app.location,
            "returnLocationId": app.location,
            "pickup": pickup,
            "return": ret,
        })
    }

    #[tokio::test]
    async fn booking_by_car_returns_pending_booking() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post_json(
                "/bookings/by-car",
                by_car(&app, "2024-01-10T00:00:00Z", "2024-01-12T00:00:00Z"),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["totalPriceCents"], 12_000);
        assert_eq!(body["returnTime"], "2024-01-12T00:00:00Z");
        assert_eq!(body["carId"], app.car);

        let id = body["id"].as_i64().unwrap();
        let (status, fetched) = send(&app.router, get(&format!("/bookings/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], id);
    }

    #[tokio::test]
    async fn booking_by_model_picks_a_car() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post_json(
                "/bookings/by-model",
                json!({
                    "clientId": app.client,
                    "carModelId": 3,
                    "pickupLocationId": app.location,
                    "returnLocationId": app.location,
                    "pickup": "2024-01-10T00:00:00Z",
                    "return": "2024-01-11T00:00:00Z",
                    "coupon": null,
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["carId"], app.car);
    }

    #[tokio::test]
    async fn overlapping_booking_is_a_business_rule_violation() {
        let app = app();
        send(
            &app.router,
            post_json(
                "/bookings/by-car",
                by_car(&app, "2024-01-10T00:00:00Z", "2024-01-12T00:00:00Z"),
            ),
        )
        .await;

        let (status, body) = send(
            &app.router,
            post_json(
                "/bookings/by-car",
                by_car(&app, "2024-01-11T00:00:00Z", "2024-01-13T00:00:00Z"),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "BUSINESS_RULE_VIOLATION");
        assert_eq!(body["message"], "Car is not available");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn locked_car_is_reported_as_conflict() {
        let app = app();
        let _held = app.store.hold_car_lock(app.car).await;

        let (status, body) = send(
            &app.router,
            post_json(
                "/bookings/by-car",
                by_car(&app, "2024-01-10T00:00:00Z", "2024-01-12T00:00:00Z"),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "RESOURCE_LOCKED");
    }

    #[rstest]
    #[case("/bookings/999", "NOT_FOUND", StatusCode::NOT_FOUND)]
    #[case(
        "/bookings/location/1/period?from=2024-01-12T00:00:00Z&to=2024-01-10T00:00:00Z",
        "BUSINESS_RULE_VIOLATION",
        StatusCode::UNPROCESSABLE_ENTITY
    )]
    #[case(
        "/cars/available?modelId=3",
        "VALIDATION_ERROR",
        StatusCode::BAD_REQUEST
    )]
    #[case(
        "/outbox/dead-letters?limit=-1",
        "VALIDATION_ERROR",
        StatusCode::BAD_REQUEST
    )]
    #[case(
        "/outbox/dead-letters?limit=0",
        "VALIDATION_ERROR",
        StatusCode::BAD_REQUEST
    )]
    #[tokio::test]
    async fn errors_map_to_status_codes(
        #[case] uri: &str,
        #[case] code: &str,
        #[case] expected: StatusCode,
    ) {
        let app = app();
        let (status, body) = send(&app.router, get(uri)).await;
        assert_eq!(status, expected);
        assert_eq!(body["code"], code);
    }

    #[tokio::test]
    async fn malformed_body_is_a_validation_error() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post_json("/bookings/by-car", json!({"clientId": "nope"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let app = app();
        let (_, created) = send(
            &app.router,
            post_json(
                "/bookings/by-car",
                by_car(&app, "2099-01-10T00:00:00Z", "2099-01-12T00:00:00Z"),
            ),
        )
        .await;
        let uri = format!("/bookings/{}/cancel", created["id"]);

        let (status, first) = send(&app.router, post_json(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "CANCELED");

        let (status, second) = send(&app.router, post_json(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn active_projections_list_live_bookings() {
        let app = app();
        let (_, created) = send(
            &app.router,
            post_json(
                "/bookings/by-car",
                by_car(&app, "2099-01-10T00:00:00Z", "2099-01-12T00:00:00Z"),
            ),
        )
        .await;

        let (status, body) = send(
            &app.router,
            get(&format!("/bookings/location/{}/active", app.location)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], created["id"]);

        let (_, by_company) = send(&app.router, get("/bookings/company/424242/active")).await;
        assert_eq!(by_company, json!([]));
    }

    #[tokio::test]
    async fn available_cars_and_dead_letters() {
        let app = app();
        let (status, body) = send(
            &app.router,
            get(&format!(
                "/cars/available?modelId=3&locationId={}&from=2024-01-10T00:00:00Z&to=2024-01-11T00:00:00Z",
                app.location
            )),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["carIds"], json!([app.car]));

        let (status, body) = send(&app.router, get("/outbox/dead-letters")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn health_check_answers() {
        let app = app();
        let response = app.router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
