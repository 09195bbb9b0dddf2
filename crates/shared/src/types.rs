//! Plan and subscription enums shared across crates

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse plan bucket used for fallback classification and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    /// Monthly credits when the product carries no explicit allowance
    pub fn default_allowance(&self) -> i64 {
        match self {
            Tier::Free => 2,
            Tier::Basic => 15,
            Tier::Pro => 50,
            Tier::Enterprise => 200,
        }
    }

    /// Themes a single transformation request may ask for
    pub fn max_prompts_per_image(&self) -> usize {
        match self {
            Tier::Free => 1,
            Tier::Basic => 2,
            Tier::Pro => 5,
            Tier::Enterprise => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mirrored subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Incomplete,
    Canceled,
}

impl SubscriptionStatus {
    /// `active` and `trialing` grant the plan allowance
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    /// States an `invoice_paid` event lifts back to `active`
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid | SubscriptionStatus::Incomplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a provider status string. Provider states without a local
    /// counterpart collapse onto the closest one.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "unpaid" | "paused" => SubscriptionStatus::Unpaid,
            "incomplete" => SubscriptionStatus::Incomplete,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionStatus::None),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// Recurring price cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    /// Convert an amount charged every `interval_count` intervals to a
    /// monthly-equivalent amount (same units)
    pub fn monthly_equivalent(&self, amount: i64, interval_count: i64) -> f64 {
        let count = interval_count.max(1) as f64;
        let per_interval = amount as f64 / count;
        match self {
            BillingInterval::Day => per_interval * 365.0 / 12.0,
            BillingInterval::Week => per_interval * 52.0 / 12.0,
            BillingInterval::Month => per_interval,
            BillingInterval::Year => per_interval / 12.0,
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(BillingInterval::Day),
            "week" => Ok(BillingInterval::Week),
            "month" => Ok(BillingInterval::Month),
            "year" => Ok(BillingInterval::Year),
            other => Err(format!("unknown billing interval: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_defaults() {
        assert_eq!(Tier::Free.default_allowance(), 2);
        assert_eq!(Tier::Basic.default_allowance(), 15);
        assert_eq!(Tier::Pro.default_allowance(), 50);
        assert_eq!(Tier::Enterprise.default_allowance(), 200);
        assert_eq!(Tier::Pro.max_prompts_per_image(), 5);
    }

    #[test]
    fn test_entitled_statuses() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        for status in [
            SubscriptionStatus::None,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Canceled,
        ] {
            assert!(!status.is_entitled(), "{} must not be entitled", status);
        }
    }

    #[test]
    fn test_status_round_trips_through_storage_string() {
        let status: SubscriptionStatus = "past_due".parse().unwrap();
        assert_eq!(status, SubscriptionStatus::PastDue);
        assert_eq!(status.as_str(), "past_due");
        assert!("paused".parse::<SubscriptionStatus>().is_err());
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete_expired"),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_monthly_equivalent() {
        assert_eq!(BillingInterval::Month.monthly_equivalent(2900, 1), 2900.0);
        assert_eq!(BillingInterval::Year.monthly_equivalent(12000, 1), 1000.0);
        assert_eq!(BillingInterval::Month.monthly_equivalent(6000, 3), 2000.0);
        assert_eq!(BillingInterval::Week.monthly_equivalent(1200, 1), 5200.0);
    }
}
