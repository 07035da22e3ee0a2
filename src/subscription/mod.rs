//! Subscriptions, plans, and activation.
//!
//! A subscription is activated only by a verified on-chain payment. Plan
//! upgrades are deferred: the requested plan parks in `pending_plan` and is
//! promoted when the payment for it settles, so an unpaid upgrade never
//! changes entitlements.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Subscription plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// No paid features.
    Free,
    /// Entry tier.
    Starter,
    /// Mid tier.
    Professional,
    /// Top tier, unmetered.
    Enterprise,
}

impl Plan {
    /// Pricing and quota limits for this plan. Negative limits mean
    /// unmetered.
    #[must_use]
    pub fn limits(self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                monthly_price_usd: 0.0,
                max_projects: 3,
                max_members: 5,
                monthly_review_limit: 100,
            },
            Self::Starter => PlanLimits {
                monthly_price_usd: 29.0,
                max_projects: 10,
                max_members: 10,
                monthly_review_limit: 1000,
            },
            Self::Professional => PlanLimits {
                monthly_price_usd: 99.0,
                max_projects: 50,
                max_members: 25,
                monthly_review_limit: 5000,
            },
            Self::Enterprise => PlanLimits {
                monthly_price_usd: 299.0,
                max_projects: -1,
                max_members: -1,
                monthly_review_limit: -1,
            },
        }
    }

    /// Amount due for one billing period on this plan, in USD.
    #[must_use]
    pub fn price_for(self, cycle: BillingCycle) -> f64 {
        let monthly = self.limits().monthly_price_usd;
        match cycle {
            BillingCycle::Monthly => monthly,
            BillingCycle::Yearly => monthly * 12.0,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
        };
        f.write_str(name)
    }
}

/// Pricing and quota limits of a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanLimits {
    /// Monthly price in USD.
    pub monthly_price_usd: f64,
    /// Project quota, negative for unmetered.
    pub max_projects: i64,
    /// Member quota, negative for unmetered.
    pub max_members: i64,
    /// Reviews allowed per month, negative for unmetered.
    pub monthly_review_limit: i64,
}

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Trial period, not yet paid.
    Trialing,
    /// Paid and in good standing.
    Active,
    /// Renewal payment missed.
    PastDue,
    /// Lapsed.
    Expired,
    /// Canceled by the owner.
    Canceled,
}

/// Billing period length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    /// One month per period.
    Monthly,
    /// One year per period.
    Yearly,
}

impl BillingCycle {
    fn period_months(self) -> Months {
        match self {
            Self::Monthly => Months::new(1),
            Self::Yearly => Months::new(12),
        }
    }
}

/// Who owns a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Owner {
    /// An individual account.
    User(String),
    /// A team account.
    Team(String),
}

impl Owner {
    /// The owning account id, regardless of kind.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Team(id) => id,
        }
    }
}

/// One subscription record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique subscription id.
    pub id: String,
    /// Owning account.
    pub owner: Owner,
    /// Plan currently in force.
    pub plan: Plan,
    /// Plan awaiting payment, promoted on settlement.
    pub pending_plan: Option<Plan>,
    /// Lifecycle state.
    pub status: SubscriptionStatus,
    /// Billing period length.
    pub billing_cycle: BillingCycle,
    /// Wallet that pays for this subscription (lowercase), once bound.
    pub wallet_address: Option<String>,
    /// Start of the current paid period.
    pub current_period_start: Option<DateTime<Utc>>,
    /// End of the current paid period.
    pub current_period_end: Option<DateTime<Utc>>,
    /// Reviews consumed in the current month. Activation never touches it.
    pub current_month_reviews: u64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a trialing subscription on the free plan.
    #[must_use]
    pub fn new(owner: Owner, billing_cycle: BillingCycle) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            plan: Plan::Free,
            pending_plan: None,
            status: SubscriptionStatus::Trialing,
            billing_cycle,
            wallet_address: None,
            current_period_start: None,
            current_period_end: None,
            current_month_reviews: 0,
            created_at: Utc::now(),
        }
    }

    /// The amount the next settlement must cover: the pending plan's price
    /// if an upgrade is queued, the current plan's otherwise.
    #[must_use]
    pub fn amount_due(&self) -> f64 {
        self.pending_plan
            .unwrap_or(self.plan)
            .price_for(self.billing_cycle)
    }

    /// Apply a verified payment: promote any pending plan, mark the
    /// subscription active, bind the paying wallet, and roll the billing
    /// period forward from now.
    pub fn activate(&mut self, paying_wallet: Option<&str>) {
        if let Some(pending) = self.pending_plan.take() {
            self.plan = pending;
        }
        self.status = SubscriptionStatus::Active;
        if let Some(wallet) = paying_wallet {
            self.wallet_address = Some(wallet.to_lowercase());
        }

        let now = Utc::now();
        self.current_period_start = Some(now);
        self.current_period_end = now.checked_add_months(self.billing_cycle.period_months());
    }

    /// Drop a queued plan change, e.g. after its payment failed.
    pub fn clear_pending_plan(&mut self) {
        self.pending_plan = None;
    }
}

/// Storage seam for subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Persist a new subscription.
    async fn insert(&self, subscription: Subscription) -> Result<()>;

    /// Fetch a subscription by id.
    async fn get(&self, subscription_id: &str) -> Result<Option<Subscription>>;

    /// Replace a stored subscription.
    async fn update(&self, subscription: Subscription) -> Result<()>;
}

/// In-memory [`SubscriptionStore`].
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl MemorySubscriptionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn insert(&self, subscription: Subscription) -> Result<()> {
        self.subscriptions
            .write()
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }

    async fn get(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().get(subscription_id).cloned())
    }

    async fn update(&self, subscription: Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        if !subscriptions.contains_key(&subscription.id) {
            return Err(Error::NotFound(format!(
                "subscription not found: {}",
                subscription.id
            )));
        }
        subscriptions.insert(subscription.id.clone(), subscription);
        Ok(())
    }
}
