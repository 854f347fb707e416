use actix_web::{dev::Server, web, App, HttpResponse, HttpServer, Responder};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::db::{DataStore, MeterEntry};
use crate::metering_modbus::registers::get_registers;
use crate::models::{MeterConfig, MeterModel, Reading};
use crate::mqtt::{MqttConnectionStatus, MqttHealth};

/// Everything the handlers need, shared between all workers
pub struct ApiState {
    pub store: Arc<DataStore>,
    pub meters: Vec<MeterConfig>,
    pub period: Duration,
    pub unreachable_after: u32,
    /// None when MQTT is switched off
    pub mqtt_health: Option<MqttHealth>,
    pub started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MeterState {
    /// Not polled yet
    NoData,
    Ok,
    /// Last poll failed
    Failed,
    /// Last reading is older than two poll intervals
    Stale,
    /// Failed too many cycles in a row
    Unreachable,
}

/// Decide what a client should think of a meter.
pub fn meter_state(entry: Option<&MeterEntry>, now: DateTime<Utc>, period: Duration, unreachable_after: u32) -> MeterState {
    let Some(entry) = entry else {
        return MeterState::NoData;
    };

    if unreachable_after > 0 && entry.consecutive_failures >= unreachable_after {
        return MeterState::Unreachable;
    }
    if !entry.reading.ok {
        return MeterState::Failed;
    }

    /* readings from the future, clock jumps, are not stale */
    if let Ok(age) = now.signed_duration_since(entry.reading.timestamp).to_std() {
        if age > period * 2 {
            return MeterState::Stale;
        }
    }
    return MeterState::Ok;
}

#[derive(Serialize, ToSchema)]
pub struct MeterResponse {
    pub address: u8,
    pub model: MeterModel,
    pub name: String,
    pub slug: String,
    pub phases: u8,
    /// Unit of every metric the meter reports, keyed like the reading values
    pub units: BTreeMap<String, String>,
    pub state: MeterState,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub reading: Option<Reading>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub mqtt: MqttHealthInfo,
    pub meters_configured: usize,
    pub meters_ok: usize,
    pub uptime_seconds: u64,
    pub timestamp: i64,
}

#[derive(Serialize, ToSchema)]
pub struct MqttHealthInfo {
    pub status: String,
    pub last_connected_ago_seconds: Option<u64>,
    pub last_message_sent_ago_seconds: Option<u64>,
    pub connection_attempts: u64,
}

impl ApiState {
    fn describe(&self, meter: &MeterConfig, now: DateTime<Utc>) -> MeterResponse {
        let entry = self.store.entry(meter.address);
        let state = meter_state(entry.as_ref(), now, self.period, self.unreachable_after);

        let (reading, last_success, consecutive_failures) = match entry {
            Some(e) => (Some(e.reading), e.last_success, e.consecutive_failures),
            None => (None, None, 0),
        };

        return MeterResponse {
            address: meter.address,
            model: meter.model,
            name: meter.display_name.clone(),
            slug: meter.slug.clone(),
            phases: meter.model.phase_count(),
            units: get_registers(meter.model).iter().map(|m| (m.name.to_string(), m.unit.to_string())).collect(),
            state,
            last_success,
            consecutive_failures,
            reading,
        };
    }
}

#[utoipa::path(get,
    path = "/health",
    summary = "Health check endpoint for container monitoring",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse)
    ),
)]
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    let now = Instant::now();
    let utc_now = Utc::now();

    let meters_ok = state
        .meters
        .iter()
        .filter(|m| state.describe(m, utc_now).state == MeterState::Ok)
        .count();

    let (mqtt, mqtt_ok) = match &state.mqtt_health {
        None => (
            MqttHealthInfo {
                status: "disabled".to_string(),
                last_connected_ago_seconds: None,
                last_message_sent_ago_seconds: None,
                connection_attempts: 0,
            },
            true,
        ),
        Some(health) => {
            let h = health.read().unwrap_or_else(PoisonError::into_inner).clone();
            let status = match &h.status {
                MqttConnectionStatus::Connected => "connected",
                MqttConnectionStatus::Disconnected => "disconnected",
                MqttConnectionStatus::Reconnecting => "reconnecting",
                MqttConnectionStatus::Error(_) => "error",
            };
            (
                MqttHealthInfo {
                    status: status.to_string(),
                    last_connected_ago_seconds: h.last_connected.map(|t| now.duration_since(t).as_secs()),
                    last_message_sent_ago_seconds: h.last_message_sent.map(|t| now.duration_since(t).as_secs()),
                    connection_attempts: h.connection_attempts,
                },
                h.status == MqttConnectionStatus::Connected,
            )
        }
    };

    let response = HealthResponse {
        status: if mqtt_ok { "healthy".to_string() } else { "unhealthy".to_string() },
        mqtt,
        meters_configured: state.meters.len(),
        meters_ok,
        uptime_seconds: state.started.elapsed().as_secs(),
        timestamp: utc_now.timestamp(),
    };

    if mqtt_ok {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

#[utoipa::path(get,
    path = "/api/meters",
    summary = "All configured meters with their latest reading",
    responses(
        (status = 200, description = "Meters in configuration order", body = Vec<MeterResponse>)
    ),
)]
async fn get_meters(state: web::Data<ApiState>) -> impl Responder {
    let now = Utc::now();
    let meters: Vec<MeterResponse> = state.meters.iter().map(|m| state.describe(m, now)).collect();
    HttpResponse::Ok().json(meters)
}

#[utoipa::path(get,
    path = "/api/meters/{address}",
    summary = "One meter with its latest reading",
    params(
        ("address" = u8, Path, description = "Modbus address of the meter")
    ),
    responses(
        (status = 200, description = "The meter", body = MeterResponse),
        (status = 404, description = "No meter with this address is configured", body = ErrorResponse)
    ),
)]
async fn get_meter(state: web::Data<ApiState>, path: web::Path<u8>) -> impl Responder {
    let address = path.into_inner();
    match state.meters.iter().find(|m| m.address == address) {
        Some(meter) => HttpResponse::Ok().json(state.describe(meter, Utc::now())),
        None => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("no meter with address {} configured", address),
        }),
    }
}

#[derive(OpenApi)]
#[openapi(
    info(description = "sdm2mqtt API description"),
    paths(health_check, get_meters, get_meter),
    components(schemas(MeterResponse, MeterState, ErrorResponse, HealthResponse, MqttHealthInfo))
)]
struct ApiDoc;

/// Register every route on an app, shared by the server and the tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/api/meters", web::get().to(get_meters))
        .route("/api/meters/{address}", web::get().to(get_meter))
        .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api/v1/openapi.json", ApiDoc::openapi()));
}

pub struct ApiManager {
    state: web::Data<ApiState>,
    port: u16,
}

impl ApiManager {
    pub fn new(state: ApiState, port: u16) -> Self {
        return ApiManager {
            state: web::Data::new(state),
            port,
        };
    }

    /// Bind the listener. The returned server does nothing until it is awaited or spawned.
    pub fn start(&self) -> std::io::Result<Server> {
        let state = self.state.clone();
        info!("API listening on 0.0.0.0:{}", self.port);

        let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
            .bind(("0.0.0.0", self.port))?
            .disable_signals()
            .run();
        return Ok(server);
    }
}
