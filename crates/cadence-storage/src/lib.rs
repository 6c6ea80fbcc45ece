//! Tenant-scoped data access + status-change notification sinks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cadence_core::{
    Customer, CustomerHealth, HealthUpdate, Order, OrderStatus, RiskStatus, StatusChangedEvent,
    Tenant, TenantSelector,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cadence-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    #[error("customer {0} not found")]
    CustomerNotFound(Uuid),
    #[error("corrupt {entity} row {id}: {reason}")]
    Decode {
        entity: &'static str,
        id: String,
        reason: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Read customers and orders for one tenant and persist computed health.
///
/// Every method takes the tenant id explicitly; implementations must never
/// return or touch rows belonging to another tenant.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn find_tenant(&self, selector: &TenantSelector) -> Result<Option<Tenant>, StoreError>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Open (not permanently closed) customers of the tenant.
    async fn list_customers(&self, tenant_id: Uuid) -> Result<Vec<Customer>, StoreError>;

    /// Orders placed at or after `since`, plus any order with no timestamp.
    async fn list_orders(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError>;

    async fn update_customer_health(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        update: &HealthUpdate,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    tenants: BTreeMap<Uuid, Tenant>,
    customers: BTreeMap<Uuid, Customer>,
    orders: Vec<Order>,
}

/// In-process store used by tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    health_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.write().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.state.write().await.customers.insert(customer.id, customer);
    }

    pub async fn insert_order(&self, order: Order) {
        self.state.write().await.orders.push(order);
    }

    pub async fn customer(&self, customer_id: Uuid) -> Option<Customer> {
        self.state.read().await.customers.get(&customer_id).cloned()
    }

    /// Simulates the datastore going away; every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn health_writes(&self) -> usize {
        self.health_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HealthStore for MemoryStore {
    async fn find_tenant(&self, selector: &TenantSelector) -> Result<Option<Tenant>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(match selector {
            TenantSelector::Id(id) => state.tenants.get(id).cloned(),
            TenantSelector::Slug(slug) => state.tenants.values().find(|t| &t.slug == slug).cloned(),
        })
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        self.check_available()?;
        let mut tenants = self.state.read().await.tenants.values().cloned().collect::<Vec<_>>();
        tenants.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(tenants)
    }

    async fn list_customers(&self, tenant_id: Uuid) -> Result<Vec<Customer>, StoreError> {
        self.check_available()?;
        let mut customers = self
            .state
            .read()
            .await
            .customers
            .values()
            .filter(|c| c.tenant_id == tenant_id && !c.is_permanently_closed)
            .cloned()
            .collect::<Vec<_>>();
        customers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(customers)
    }

    async fn list_orders(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .orders
            .iter()
            .filter(|o| o.tenant_id == tenant_id && o.customer_id == customer_id)
            .filter(|o| o.ordered_at.map_or(true, |at| at >= since))
            .cloned()
            .collect())
    }

    async fn update_customer_health(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        update: &HealthUpdate,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let customer = state
            .customers
            .get_mut(&customer_id)
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or(StoreError::CustomerNotFound(customer_id))?;
        customer.health = update.health.clone();
        customer.last_assessed_at = Some(update.assessed_at);
        self.health_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Postgres-backed store. The pool is owned by the caller and shared by clone.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, StoreError> {
    Ok(Tenant {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
    })
}

fn customer_from_row(row: &PgRow) -> Result<Customer, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let risk_status: String = row.try_get("risk_status")?;
    let risk_status = risk_status.parse::<RiskStatus>().map_err(|err| {
        StoreError::Decode {
            entity: "customer",
            id: id.to_string(),
            reason: err.to_string(),
        }
    })?;
    Ok(Customer {
        id,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        established_revenue: row.try_get("established_revenue")?,
        is_permanently_closed: row.try_get("is_permanently_closed")?,
        last_assessed_at: row.try_get("last_assessed_at")?,
        health: CustomerHealth {
            risk_status,
            last_order_date: row.try_get("last_order_date")?,
            next_expected_order_date: row.try_get("next_expected_order_date")?,
            average_order_interval_days: row.try_get("average_order_interval_days")?,
            dormancy_since: row.try_get("dormancy_since")?,
            reactivated_date: row.try_get("reactivated_date")?,
        },
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status.parse::<OrderStatus>().map_err(|err| StoreError::Decode {
        entity: "order",
        id: id.to_string(),
        reason: err.to_string(),
    })?;
    Ok(Order {
        id,
        tenant_id: row.try_get("tenant_id")?,
        customer_id: row.try_get("customer_id")?,
        ordered_at: row.try_get("ordered_at")?,
        status,
        total: row.try_get("total")?,
    })
}

#[async_trait]
impl HealthStore for PgStore {
    async fn find_tenant(&self, selector: &TenantSelector) -> Result<Option<Tenant>, StoreError> {
        let row = match selector {
            TenantSelector::Id(id) => {
                sqlx::query("SELECT id, slug, name FROM tenants WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            TenantSelector::Slug(slug) => {
                sqlx::query("SELECT id, slug, name FROM tenants WHERE slug = $1")
                    .bind(slug)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query("SELECT id, slug, name FROM tenants ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tenant_from_row).collect()
    }

    async fn list_customers(&self, tenant_id: Uuid) -> Result<Vec<Customer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, name, established_revenue, is_permanently_closed,
                   risk_status, last_order_date, next_expected_order_date,
                   average_order_interval_days, dormancy_since, reactivated_date,
                   last_assessed_at
              FROM customers
             WHERE tenant_id = $1
               AND is_permanently_closed = FALSE
             ORDER BY name, id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(customer_from_row).collect()
    }

    async fn list_orders(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, customer_id, ordered_at, status, total
              FROM orders
             WHERE tenant_id = $1
               AND customer_id = $2
               AND (ordered_at IS NULL OR ordered_at >= $3)
             ORDER BY ordered_at DESC NULLS FIRST
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn update_customer_health(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        update: &HealthUpdate,
    ) -> Result<(), StoreError> {
        let health = &update.health;
        let result = sqlx::query(
            r#"
            UPDATE customers
               SET risk_status = $3,
                   last_order_date = $4,
                   next_expected_order_date = $5,
                   average_order_interval_days = $6,
                   dormancy_since = $7,
                   reactivated_date = $8,
                   last_assessed_at = $9
             WHERE tenant_id = $1
               AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(health.risk_status.as_str())
        .bind(health.last_order_date)
        .bind(health.next_expected_order_date)
        .bind(health.average_order_interval_days)
        .bind(health.dormancy_since)
        .bind(health.reactivated_date)
        .bind(update.assessed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CustomerNotFound(customer_id));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// Downstream channel for status-change notifications.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &StatusChangedEvent) -> Result<(), SinkError>;
}

/// Stable key for one status transition evaluated on one calendar day.
///
/// Replays of the same transition on the same day hash identically so
/// receivers can drop duplicates.
pub fn event_idempotency_key(event: &StatusChangedEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.tenant_id.as_bytes());
    hasher.update(event.customer_id.as_bytes());
    hasher.update(event.previous_status.as_str().as_bytes());
    hasher.update(b"->");
    hasher.update(event.new_status.as_str().as_bytes());
    hasher.update(event.evaluated_at.date_naive().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn publish(&self, _event: &StatusChangedEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StatusChangedEvent>>,
    reject_all: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every publish fails.
    pub fn rejecting() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            reject_all: true,
        }
    }

    pub async fn events(&self) -> Vec<StatusChangedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &StatusChangedEvent) -> Result<(), SinkError> {
        if self.reject_all {
            return Err(SinkError::Rejected(format!(
                "customer {} {} -> {}",
                event.customer_id, event.previous_status, event.new_status
            )));
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Redelivery schedule for a webhook event: the delay doubles per retry and
/// is capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRetry {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DeliveryRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl DeliveryRetry {
    fn delay_before(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A receiver that is down, overloaded or throttling gets the event again;
/// one that rejected the payload does not.
fn should_redeliver(outcome: &Result<reqwest::Response, reqwest::Error>) -> bool {
    match outcome {
        Ok(resp) => {
            let status = resp.status();
            status.is_server_error()
                || status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::REQUEST_TIMEOUT
        }
        Err(err) => err.is_timeout() || err.is_connect(),
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: DeliveryRetry,
}

impl WebhookConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            retry: DeliveryRetry::default(),
        }
    }
}

/// POSTs each event as JSON, retrying transient failures with capped backoff.
#[derive(Debug)]
pub struct WebhookSink {
    client: reqwest::Client,
    endpoint: String,
    retry: DeliveryRetry,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            retry: config.retry,
        })
    }
}

impl WebhookSink {
    async fn deliver(&self, event: &StatusChangedEvent, key: &str) -> Result<(), SinkError> {
        let mut retries = 0;
        loop {
            let outcome = self
                .client
                .post(&self.endpoint)
                .header("Idempotency-Key", key)
                .json(event)
                .send()
                .await;
            if matches!(&outcome, Ok(resp) if resp.status().is_success()) {
                return Ok(());
            }
            if retries < self.retry.max_retries && should_redeliver(&outcome) {
                let delay = self.retry.delay_before(retries);
                retries += 1;
                warn!(retry = retries, delay_ms = delay.as_millis() as u64, "webhook delivery failed; retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(match outcome {
                Ok(resp) => SinkError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                },
                Err(err) => SinkError::Request(err),
            });
        }
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn publish(&self, event: &StatusChangedEvent) -> Result<(), SinkError> {
        let key = event_idempotency_key(event);
        let span = info_span!(
            "webhook_publish",
            customer_id = %event.customer_id,
            new_status = %event.new_status
        );
        self.deliver(event, &key).instrument(span).await
    }
}
