use crate::error::AppError;
use crate::ledger::UsageLedger;
use crate::notify::{Alert, Notifier, Severity};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;

/// Point-in-time spend report. Recomputed from the ledger on every call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetStatus {
    pub daily_spend: f64,
    pub monthly_spend: f64,
    pub daily_budget: f64,
    pub monthly_budget: f64,
    pub daily_pct: f64,
    pub monthly_pct: f64,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RemainingBudget {
    pub daily_remaining: f64,
    pub monthly_remaining: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetLimits {
    pub daily_usd: f64,
    pub monthly_usd: f64,
    pub alert_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_usd: 50.0,
            monthly_usd: 1000.0,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
        }
    }
}

/// Advisory spend monitor over the usage ledger.
///
/// Never rejects calls itself; callers decide what to do with
/// [`BudgetMonitor::is_within_budget`].
pub struct BudgetMonitor {
    ledger: Arc<dyn UsageLedger>,
    limits: BudgetLimits,
    notifier: Option<Arc<dyn Notifier>>,
}

#[derive(Debug, Clone, Copy)]
struct Spend {
    daily: f64,
    monthly: f64,
}

impl BudgetMonitor {
    pub fn new(ledger: Arc<dyn UsageLedger>, limits: BudgetLimits) -> Self {
        Self {
            ledger,
            limits,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    async fn current_spend(&self) -> Result<Spend, AppError> {
        let now = Utc::now();
        let daily = self.ledger.sum_cost(now - Duration::hours(24)).await?;
        let monthly = self.ledger.sum_cost(now - Duration::days(30)).await?;
        Ok(Spend { daily, monthly })
    }

    pub async fn check_and_alert(&self) -> Result<BudgetStatus, AppError> {
        let (status, alerts) = self.evaluate().await?;
        for alert in &alerts {
            self.dispatch(alert).await;
        }
        Ok(status)
    }

    /// Same figures as [`BudgetMonitor::check_and_alert`] without notifying.
    pub async fn status(&self) -> Result<BudgetStatus, AppError> {
        Ok(self.evaluate().await?.0)
    }

    async fn evaluate(&self) -> Result<(BudgetStatus, Vec<Alert>), AppError> {
        let spend = self.current_spend().await?;
        let mut alerts = Vec::new();
        let mut status = BudgetStatus {
            daily_spend: spend.daily,
            monthly_spend: spend.monthly,
            daily_budget: self.limits.daily_usd,
            monthly_budget: self.limits.monthly_usd,
            daily_pct: percent_used(spend.daily, self.limits.daily_usd),
            monthly_pct: percent_used(spend.monthly, self.limits.monthly_usd),
            alerts: Vec::new(),
        };

        for (label, spent, budget) in [
            ("Daily", spend.daily, self.limits.daily_usd),
            ("Monthly", spend.monthly, self.limits.monthly_usd),
        ] {
            if let Some(alert) = window_alert(label, spent, budget, self.limits.alert_threshold) {
                status.alerts.push(alert.text.clone());
                alerts.push(alert);
            }
        }

        Ok((status, alerts))
    }

    pub async fn is_within_budget(&self) -> Result<bool, AppError> {
        let spend = self.current_spend().await?;
        Ok(under(spend.daily, self.limits.daily_usd)
            && under(spend.monthly, self.limits.monthly_usd))
    }

    pub async fn get_remaining_budget(&self) -> Result<RemainingBudget, AppError> {
        let spend = self.current_spend().await?;
        Ok(RemainingBudget {
            daily_remaining: remaining(spend.daily, self.limits.daily_usd),
            monthly_remaining: remaining(spend.monthly, self.limits.monthly_usd),
        })
    }

    async fn dispatch(&self, alert: &Alert) {
        let Some(notifier) = &self.notifier else {
            tracing::warn!(
                event_name = "budget.alert_undelivered",
                severity = %alert.severity,
                "no notification channel configured: {}",
                alert.text
            );
            return;
        };
        if let Err(err) = notifier.notify(alert).await {
            tracing::warn!(
                event_name = "budget.alert_failed",
                severity = %alert.severity,
                error = %err,
                "budget alert dispatch failed"
            );
        }
    }
}

fn budget_is_valid(budget: f64) -> bool {
    budget.is_finite() && budget > 0.0
}

/// A non-positive budget reads as fully consumed.
fn percent_used(spent: f64, budget: f64) -> f64 {
    if !budget_is_valid(budget) {
        return 100.0;
    }
    spent / budget * 100.0
}

fn under(spent: f64, budget: f64) -> bool {
    budget_is_valid(budget) && spent < budget
}

fn remaining(spent: f64, budget: f64) -> f64 {
    if !budget_is_valid(budget) {
        return 0.0;
    }
    (budget - spent).max(0.0)
}

fn window_alert(label: &str, spent: f64, budget: f64, threshold: f64) -> Option<Alert> {
    if !budget_is_valid(budget) {
        return Some(Alert {
            text: format!(
                "{label} budget is not configured (limit {budget:.2}); treating as exhausted"
            ),
            severity: Severity::Critical,
        });
    }
    if spent < threshold * budget {
        return None;
    }
    let pct = percent_used(spent, budget);
    let severity = if spent >= budget {
        Severity::Critical
    } else {
        Severity::Warning
    };
    Some(Alert {
        text: format!("{label} spend ${spent:.2} is {pct:.1}% of ${budget:.2} budget"),
        severity,
    })
}
