//! Event payload synthesis.
//!
//! Produces well-formed ingest payloads for the three event variants the
//! ingestion API accepts. Variant selection is a pure function of the index
//! (`index mod 3`), so a run's mix is reproducible regardless of platform.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Logical event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    View,
    Action,
    Purchase,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::View, EventKind::Action, EventKind::Purchase];

    /// Deterministic mapping used when the caller does not pick a variant:
    /// 0 -> view, 1 -> action, 2 -> purchase, repeating.
    pub fn for_index(index: u64) -> Self {
        Self::ALL[(index % Self::ALL.len() as u64) as usize]
    }

    /// Wire name carried in the `eventType` field.
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::View => "page_view",
            EventKind::Action => "user_action",
            EventKind::Purchase => "purchase",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price: f64,
}

/// Variant-specific fields, tagged on the wire by `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum EventBody {
    #[serde(rename_all = "camelCase")]
    PageView {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        referrer: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserAction {
        action_name: String,
        action_value: String,
    },
    #[serde(rename_all = "camelCase")]
    Purchase {
        action_name: String,
        amount: f64,
        currency: String,
        items: Vec<PurchaseItem>,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::PageView { .. } => EventKind::View,
            EventBody::UserAction { .. } => EventKind::Action,
            EventBody::Purchase { .. } => EventKind::Purchase,
        }
    }
}

/// A single ingest payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

/// Stateless event factory.
#[derive(Debug, Clone)]
pub struct EventSynthesizer {
    tenants: Vec<String>,
    source: String,
    backdate: Option<ChronoDuration>,
}

impl Default for EventSynthesizer {
    fn default() -> Self {
        Self::new(vec!["tenant-loadtest".to_string()])
    }
}

impl EventSynthesizer {
    /// Tenants are rotated by index. An empty list falls back to a single
    /// `tenant-loadtest` tenant.
    pub fn new(tenants: Vec<String>) -> Self {
        let tenants = if tenants.is_empty() {
            vec!["tenant-loadtest".to_string()]
        } else {
            tenants
        };
        Self {
            tenants,
            source: "/load/test".to_string(),
            backdate: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Back-date `createdAt` on every produced event (late-arrival probe).
    pub fn with_backdate(mut self, offset: std::time::Duration) -> Self {
        self.backdate = ChronoDuration::from_std(offset).ok();
        self
    }

    pub fn tenants(&self) -> &[String] {
        &self.tenants
    }

    /// Build the event at `index`. When `kind` is `None` the variant comes
    /// from [`EventKind::for_index`].
    pub fn synthesize(&self, index: u64, kind: Option<EventKind>) -> Event {
        let kind = kind.unwrap_or_else(|| EventKind::for_index(index));
        let tenant = &self.tenants[(index % self.tenants.len() as u64) as usize];

        let body = match kind {
            EventKind::View => EventBody::PageView {
                url: format!("https://example.com/products/{}", index % 1_000),
                referrer: None,
            },
            EventKind::Action => EventBody::UserAction {
                action_name: "add_to_cart".to_string(),
                action_value: format!("product_{}", index % 1_000),
            },
            EventKind::Purchase => {
                let quantity = (index % 3) as u32 + 1;
                let unit_price = 25.5;
                EventBody::Purchase {
                    action_name: "purchase".to_string(),
                    amount: unit_price * quantity as f64,
                    currency: "USD".to_string(),
                    items: vec![PurchaseItem {
                        sku: format!("sku-{}", index % 100),
                        quantity,
                        unit_price,
                    }],
                }
            }
        };

        let mut created_at = Utc::now();
        if let Some(offset) = self.backdate {
            created_at -= offset;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), self.source.clone());

        Event {
            event_id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            correlation_id: Uuid::new_v4().to_string(),
            user_id: format!("user-{index:06}"),
            created_at,
            body,
            metadata,
        }
    }

    /// Events `start..start + size`, each with its index-derived variant.
    pub fn synthesize_batch(&self, start: u64, size: usize) -> Vec<Event> {
        (start..start + size as u64)
            .map(|index| self.synthesize(index, None))
            .collect()
    }
}
