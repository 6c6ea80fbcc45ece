//! Core domain model for customer cadence health.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cadence-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Health classification stored on every customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    #[default]
    Healthy,
    AtRiskCadence,
    AtRiskRevenue,
    Dormant,
    Prospect,
}

impl RiskStatus {
    pub const ALL: [RiskStatus; 5] = [
        RiskStatus::Healthy,
        RiskStatus::AtRiskCadence,
        RiskStatus::AtRiskRevenue,
        RiskStatus::Dormant,
        RiskStatus::Prospect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::Healthy => "HEALTHY",
            RiskStatus::AtRiskCadence => "AT_RISK_CADENCE",
            RiskStatus::AtRiskRevenue => "AT_RISK_REVENUE",
            RiskStatus::Dormant => "DORMANT",
            RiskStatus::Prospect => "PROSPECT",
        }
    }
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "risk status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    Pending,
    Submitted,
    PartiallyFulfilled,
    Fulfilled,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Draft,
        OrderStatus::Pending,
        OrderStatus::Submitted,
        OrderStatus::PartiallyFulfilled,
        OrderStatus::Fulfilled,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFulfilled => "PARTIALLY_FULFILLED",
            OrderStatus::Fulfilled => "FULFILLED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    /// Drafts were never placed and cancelled orders never shipped; neither says
    /// anything about how often the customer buys.
    pub fn counts_toward_cadence(&self) -> bool {
        !matches!(self, OrderStatus::Draft | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "order status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: Option<String>,
}

impl Tenant {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.slug)
    }
}

/// How a caller names the tenant to assess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSelector {
    Id(Uuid),
    Slug(String),
}

impl fmt::Display for TenantSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantSelector::Id(id) => write!(f, "id={id}"),
            TenantSelector::Slug(slug) => write!(f, "slug={slug}"),
        }
    }
}

/// Derived health fields the assessment owns on a customer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CustomerHealth {
    pub risk_status: RiskStatus,
    pub last_order_date: Option<DateTime<Utc>>,
    pub next_expected_order_date: Option<DateTime<Utc>>,
    pub average_order_interval_days: Option<f64>,
    pub dormancy_since: Option<DateTime<Utc>>,
    pub reactivated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub established_revenue: Option<f64>,
    pub is_permanently_closed: bool,
    pub last_assessed_at: Option<DateTime<Utc>>,
    pub health: CustomerHealth,
}

impl Customer {
    pub fn new(tenant_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            established_revenue: None,
            is_permanently_closed: false,
            last_assessed_at: None,
            health: CustomerHealth::default(),
        }
    }

    pub fn risk_status(&self) -> RiskStatus {
        self.health.risk_status
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    /// Nullable upstream; a qualifying order without a timestamp is malformed.
    pub ordered_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub total: Option<f64>,
}

impl Order {
    pub fn placed(customer: &Customer, ordered_at: DateTime<Utc>, total: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: customer.tenant_id,
            customer_id: customer.id,
            ordered_at: Some(ordered_at),
            status: OrderStatus::Delivered,
            total: Some(total),
        }
    }
}

/// A write the assessment wants applied to one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthUpdate {
    pub health: CustomerHealth,
    pub assessed_at: DateTime<Utc>,
}

/// Published once per customer whose risk status actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangedEvent {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub previous_status: RiskStatus,
    pub new_status: RiskStatus,
    pub evaluated_at: DateTime<Utc>,
}
