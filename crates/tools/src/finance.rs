use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use strand_core::{CapabilityDescriptor, Error, Result};

use crate::Capability;

/// Debts above this amount get the smaller settlement discount.
const LARGE_DEBT_THRESHOLD: f64 = 10_000.0;

pub fn capabilities() -> Vec<Arc<dyn Capability>> {
    vec![Arc::new(EmiCalculator), Arc::new(SettlementPolicy)]
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Equated monthly installment for `principal` at `annual_rate` percent over `months`.
pub fn emi(principal: f64, annual_rate: f64, months: u32) -> f64 {
    let n = months as f64;
    let r = annual_rate / (12.0 * 100.0);
    if r == 0.0 {
        return principal / n;
    }
    let growth = (1.0 + r).powf(n);
    principal * r * growth / (growth - 1.0)
}

// ============ calculate_emi ============

pub struct EmiCalculator;

#[async_trait]
impl Capability for EmiCalculator {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "calculate_emi",
            "Calculate the equated monthly installment for a loan settlement.",
            json!({
                "type": "object",
                "properties": {
                    "principal": {
                        "type": "number",
                        "exclusiveMinimum": 0,
                        "description": "Amount of debt to settle"
                    },
                    "rate_of_interest": {
                        "type": "number",
                        "minimum": 0,
                        "description": "Annual interest rate in percent, e.g. 10 for 10%"
                    },
                    "tenure_months": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Number of months to pay back the debt"
                    }
                },
                "required": ["principal", "rate_of_interest", "tenure_months"]
            }),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        let principal = arguments["principal"].as_f64();
        let rate = arguments["rate_of_interest"].as_f64();
        let months = arguments["tenure_months"].as_u64();
        let (Some(principal), Some(rate), Some(months)) = (principal, rate, months) else {
            return Err(Error::handler("calculate_emi", "arguments out of range"));
        };
        let months = u32::try_from(months).map_err(|e| Error::handler("calculate_emi", e))?;
        let value = round2(emi(principal, rate, months));
        Ok(json!({
            "emi": value,
            "principal": principal,
            "rate_of_interest": rate,
            "tenure_months": months,
            "summary": format!(
                "The EMI for a principal of {} at {}% for {} months is {:.2}",
                principal, rate, months, value
            )
        }))
    }
}

// ============ check_settlement_policy ============

pub struct SettlementPolicy;

impl SettlementPolicy {
    pub fn max_discount_percent(debt_amount: f64) -> u32 {
        if debt_amount > LARGE_DEBT_THRESHOLD {
            20
        } else {
            30
        }
    }
}

#[async_trait]
impl Capability for SettlementPolicy {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "check_settlement_policy",
            "Look up the maximum one-time settlement discount allowed for a debt.",
            json!({
                "type": "object",
                "properties": {
                    "debt_amount": {
                        "type": "number",
                        "minimum": 0,
                        "description": "Current total debt amount"
                    }
                },
                "required": ["debt_amount"]
            }),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        let debt = arguments["debt_amount"]
            .as_f64()
            .ok_or_else(|| Error::handler("check_settlement_policy", "debt_amount is not a number"))?;
        let discount = Self::max_discount_percent(debt);
        let band = if debt > LARGE_DEBT_THRESHOLD { "over" } else { "under" };
        Ok(json!({
            "debt_amount": debt,
            "max_discount_percent": discount,
            "summary": format!(
                "For debts {} 10,000 the maximum one-time settlement discount is {}%",
                band, discount
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emi_zero_rate_is_even_split() {
        assert_eq!(emi(1200.0, 0.0, 12), 100.0);
    }

    #[test]
    fn test_emi_known_value() {
        // 100000 at 12% over 12 months
        assert_eq!(round2(emi(100_000.0, 12.0, 12)), 8884.88);
    }

    #[tokio::test]
    async fn test_calculate_emi_output() {
        let out = EmiCalculator
            .execute(json!({"principal": 5000, "rate_of_interest": 10, "tenure_months": 6}))
            .await
            .unwrap();
        assert_eq!(out["tenure_months"], 6);
        assert!(out["emi"].as_f64().unwrap() > 5000.0 / 6.0);
    }

    #[tokio::test]
    async fn test_settlement_bands() {
        let small = SettlementPolicy.execute(json!({"debt_amount": 8000})).await.unwrap();
        assert_eq!(small["max_discount_percent"], 30);
        let edge = SettlementPolicy.execute(json!({"debt_amount": 10000})).await.unwrap();
        assert_eq!(edge["max_discount_percent"], 30);
        let large = SettlementPolicy.execute(json!({"debt_amount": 25000.5})).await.unwrap();
        assert_eq!(large["max_discount_percent"], 20);
    }
}
