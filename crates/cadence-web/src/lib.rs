//! Axum trigger surface for the customer health assessment.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cadence_assess::{build_scheduler, AssessConfig, AssessmentError, AssessmentJob};
use cadence_core::TenantSelector;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cadence-web";

#[derive(Clone)]
pub struct AppState {
    pub job: Arc<AssessmentJob>,
}

impl AppState {
    pub fn new(job: Arc<AssessmentJob>) -> Self {
        Self { job }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AssessmentQuery {
    tenant_id: Option<Uuid>,
    tenant_slug: Option<String>,
    /// Evaluation time override for replays; defaults to the wall clock.
    now: Option<DateTime<Utc>>,
}

impl AssessmentQuery {
    fn selector(&self) -> Result<Option<TenantSelector>, String> {
        match (self.tenant_id, self.tenant_slug.as_deref()) {
            (Some(_), Some(_)) => Err("pass either tenantId or tenantSlug, not both".into()),
            (Some(id), None) => Ok(Some(TenantSelector::Id(id))),
            (None, Some(slug)) if !slug.trim().is_empty() => {
                Ok(Some(TenantSelector::Slug(slug.trim().to_string())))
            }
            _ => Ok(None),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/jobs/health-assessment",
            get(health_assessment_handler).post(health_assessment_handler),
        )
        .route("/jobs/health-assessment/status", get(health_assessment_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CADENCE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = AssessConfig::from_env();
    let job = Arc::new(config.build_job().await?);

    let scheduler = if config.scheduler_enabled {
        let sched = build_scheduler(job.clone(), &config.cron, config.default_selector()).await?;
        sched.start().await?;
        info!(cron = %config.cron, "health assessment scheduler started");
        Some(sched)
    } else {
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(job))).await?;
    drop(scheduler);
    Ok(())
}

async fn health_assessment_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssessmentQuery>,
) -> Response {
    let selector = match query.selector() {
        Ok(selector) => selector,
        Err(message) => return failure(StatusCode::BAD_REQUEST, message),
    };
    let now = query.now.unwrap_or_else(Utc::now);
    match state.job.run(selector, now).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn health_assessment_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({ "running": state.job.is_running() })).into_response()
}

fn error_status(err: &AssessmentError) -> StatusCode {
    match err {
        AssessmentError::TenantNotFound(_) => StatusCode::NOT_FOUND,
        AssessmentError::AlreadyRunning => StatusCode::CONFLICT,
        AssessmentError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
        AssessmentError::InvalidPolicy(_) | AssessmentError::Worker(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &AssessmentError) -> Response {
    failure(error_status(err), err.to_string())
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cadence_assess::ThresholdPolicy;
    use cadence_core::{Customer, Order, Tenant};
    use cadence_storage::{MemoryStore, RecordingSink};
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn seeded() -> (Arc<MemoryStore>, Tenant, Customer) {
        let store = Arc::new(MemoryStore::new());
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: "well-crafted".into(),
            name: None,
        };
        store.insert_tenant(tenant.clone()).await;
        let customer = Customer::new(tenant.id, "Harbor Wine Bar");
        store.insert_customer(customer.clone()).await;
        let now = Utc::now();
        store
            .insert_order(Order::placed(&customer, now - Duration::days(100), 250.0))
            .await;
        (store, tenant, customer)
    }

    fn app_for(store: Arc<MemoryStore>) -> Router {
        let job = AssessmentJob::new(store, ThresholdPolicy::default())
            .unwrap()
            .with_sink(Arc::new(RecordingSink::new()));
        app(AppState::new(Arc::new(job)))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_healthz() {
        let (store, _, _) = seeded().await;
        let resp = app_for(store)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_returns_summary_json() {
        let (store, _, customer) = seeded().await;
        let resp = app_for(store.clone())
            .oneshot(
                Request::builder()
                    .uri("/jobs/health-assessment?tenantSlug=well-crafted")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["tenantsProcessed"], 1);
        assert_eq!(body["customersScanned"], 1);
        assert_eq!(body["statusesChanged"], 1);
        assert_eq!(body["errors"], 0);
        assert_eq!(
            store.customer(customer.id).await.unwrap().risk_status(),
            cadence_core::RiskStatus::Dormant
        );
    }

    #[tokio::test]
    async fn trigger_accepts_post_and_fixed_evaluation_time() {
        let (store, tenant, _) = seeded().await;
        let uri = format!(
            "/jobs/health-assessment?tenantId={}&now=2020-01-01T00:00:00Z",
            tenant.id
        );
        let resp = app_for(store)
            .oneshot(Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["evaluatedAt"], "2020-01-01T00:00:00Z");
        // the order lies in the future relative to 2020
        assert_eq!(body["tenants"][0]["statuses"]["prospect"], 1);
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let (store, _, _) = seeded().await;
        let resp = app_for(store)
            .oneshot(
                Request::builder()
                    .uri("/jobs/health-assessment?tenantSlug=missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "tenant not found (slug=missing)");
    }

    #[tokio::test]
    async fn conflicting_selectors_are_rejected() {
        let (store, tenant, _) = seeded().await;
        let uri = format!("/jobs/health-assessment?tenantId={}&tenantSlug=well-crafted", tenant.id);
        let resp = app_for(store)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn storage_outage_is_service_unavailable() {
        let (store, _, _) = seeded().await;
        store.set_unavailable(true);
        let resp = app_for(store)
            .oneshot(Request::builder().uri("/jobs/health-assessment").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["success"], false);
    }

    #[tokio::test]
    async fn status_reports_idle_job() {
        let (store, _, _) = seeded().await;
        let resp = app_for(store)
            .oneshot(
                Request::builder()
                    .uri("/jobs/health-assessment/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["running"], false);
    }

    #[test]
    fn overlapping_run_maps_to_conflict() {
        assert_eq!(error_status(&AssessmentError::AlreadyRunning), StatusCode::CONFLICT);
    }
}
