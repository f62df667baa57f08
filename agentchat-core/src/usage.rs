//! Usage and cost accounting

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::llm::TokenUsage;
use crate::types::{ModelProfile, OperationKind, UsageRecord};

/// Decimal places kept for stored costs
pub const COST_SCALE: u32 = 8;

/// Token-based cost of one call.
///
/// `input/1000 * price_in + output/1000 * price_out`. A missing price or
/// count contributes zero. Rounded half away from zero; a zero total is `None`.
pub fn cost(model: &ModelProfile, input_tokens: Option<u32>, output_tokens: Option<u32>) -> Option<Decimal> {
    let per_thousand = Decimal::from(1000);
    let term = |tokens: Option<u32>, price: Option<Decimal>| match (tokens, price) {
        (Some(tokens), Some(price)) => Decimal::from(tokens) / per_thousand * price,
        _ => Decimal::ZERO,
    };

    let total = term(input_tokens, model.input_price_per_1k)
        + term(output_tokens, model.output_price_per_1k);
    let total = total.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero);

    if total.is_zero() {
        None
    } else {
        Some(total.normalize())
    }
}

/// Everything needed to build a usage record for one invocation
#[derive(Debug, Clone)]
pub struct UsageContext<'a> {
    pub session_id: i64,
    pub user_id: i64,
    pub provider: &'a str,
    pub model: &'a ModelProfile,
    pub operation: OperationKind,
}

impl UsageContext<'_> {
    /// Record for a successful call
    pub fn success(&self, usage: TokenUsage, latency_ms: i64) -> UsageRecord {
        self.record(usage, true, latency_ms, None)
    }

    /// Record for a failed call; tokens and cost are left empty
    pub fn failure(&self, latency_ms: i64, error: &str) -> UsageRecord {
        self.record(TokenUsage::default(), false, latency_ms, Some(error.to_string()))
    }

    fn record(
        &self,
        usage: TokenUsage,
        success: bool,
        latency_ms: i64,
        error_message: Option<String>,
    ) -> UsageRecord {
        UsageRecord {
            id: 0,
            request_id: Uuid::new_v4().to_string(),
            session_id: self.session_id,
            user_id: self.user_id,
            provider: self.provider.to_string(),
            model: self.model.model_key.clone(),
            operation: self.operation,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: cost(self.model, usage.input_tokens, usage.output_tokens),
            currency: self.model.currency.clone(),
            success,
            latency_ms: latency_ms.max(1),
            error_message,
            created_at: Utc::now(),
        }
    }
}
