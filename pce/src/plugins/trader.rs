//! Trader domain plugins: deterministic gate ordering for trade plans.
//!
//! Market signals pass through three gates in fixed order, macro regime
//! first, model confidence second, guardrails last. Any failed gate yields
//! a NO_TRADE plan; the per-gate results ride in the explain bag. The
//! trader UI controls (pause/resume/reset/config) are trader-local and do
//! not reach the core surface.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::PceResult;
use crate::plugins::{DecisionPlugin, ValueModelPlugin};
use crate::types::{ActionPlan, CciReading, JsonMap, PceEvent};
use crate::vel::ValueAssessment;

const DEFAULT_P_WIN_THRESHOLD: f64 = 0.55;
const MAX_UNCERTAINTY: f64 = 0.45;
const MAX_TRADES_PER_DAY: i64 = 6;
const MAX_TRADES_PER_ASSET_DAY: i64 = 2;
const DAILY_DRAWDOWN_LIMIT: f64 = 0.02;
const MONTHLY_DRAWDOWN_LIMIT: f64 = 0.06;

fn is_trader(event: &PceEvent) -> bool {
    event.domain() == "trader"
}

fn trader_slice<'a>(state: &'a JsonMap) -> JsonMap {
    state
        .get("trader")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Value model
// ---------------------------------------------------------------------------

/// Signal-quality scoring: confident, low-uncertainty signals in a benign
/// regime score high; drawdown pressure drags the score down.
pub struct TraderValueModel;

impl ValueModelPlugin for TraderValueModel {
    fn name(&self) -> &'static str {
        "trader.value"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        is_trader(event)
    }

    fn evaluate(&self, event: &PceEvent, state: &JsonMap) -> PceResult<ValueAssessment> {
        let p_win = event.payload_f64("p_win").unwrap_or(0.5).clamp(0.0, 1.0);
        let uncertainty = event.payload_f64("uncertainty").unwrap_or(1.0).clamp(0.0, 1.0);
        let regime = event.payload_str("macro_regime").unwrap_or("neutral");
        let regime_score: f64 = match regime {
            "bull" => 1.0,
            "neutral" => 0.7,
            "bear" => 0.2,
            _ => 0.4,
        };

        let trader = trader_slice(state);
        let dd_day = trader.get("dd_day").and_then(Value::as_f64).unwrap_or(0.0);
        let drawdown_score = (1.0 - dd_day / DAILY_DRAWDOWN_LIMIT).clamp(0.0, 1.0);

        let mut assessment = ValueAssessment::new(
            0.35 * p_win + 0.25 * (1.0 - uncertainty) + 0.2 * regime_score + 0.2 * drawdown_score,
        );
        if dd_day >= DAILY_DRAWDOWN_LIMIT {
            assessment
                .violations
                .push("financial_responsibility".to_string());
        }
        Ok(assessment)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

pub struct TraderDecisionPlugin;

#[async_trait]
impl DecisionPlugin for TraderDecisionPlugin {
    fn name(&self) -> &'static str {
        "trader.decision"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        is_trader(event) && event.event_type == "market_signal"
    }

    async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        assessment: &ValueAssessment,
        cci: &CciReading,
    ) -> PceResult<ActionPlan> {
        let symbol = event.payload_str("symbol").unwrap_or("UNKNOWN").to_string();
        let p_win = event.payload_f64("p_win").unwrap_or(0.5);
        let uncertainty = event.payload_f64("uncertainty").unwrap_or(1.0);
        let macro_regime = event.payload_str("macro_regime").unwrap_or("neutral").to_string();

        let trader = trader_slice(state);
        let threshold = trader
            .get("dynamic_threshold")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_P_WIN_THRESHOLD);
        let limits = trader
            .get("limits")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let trades_total_day = limits
            .get("trades_total_day")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let trades_for_symbol = limits
            .get("trades_by_asset_day")
            .and_then(Value::as_object)
            .and_then(|by_asset| by_asset.get(&symbol))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let dd_day = trader.get("dd_day").and_then(Value::as_f64).unwrap_or(0.0);
        let dd_month = trader.get("dd_month").and_then(Value::as_f64).unwrap_or(0.0);
        let lock_entries = trader
            .get("lock_entries")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let macro_pass = macro_regime != "bear" && macro_regime != "invalid";
        let model_pass = p_win >= threshold && uncertainty <= MAX_UNCERTAINTY;
        let guardrails_pass = !lock_entries
            && trades_total_day < MAX_TRADES_PER_DAY
            && trades_for_symbol < MAX_TRADES_PER_ASSET_DAY
            && dd_day < DAILY_DRAWDOWN_LIMIT
            && dd_month < MONTHLY_DRAWDOWN_LIMIT;

        let gate_results = vec![
            json!({"gate": "macro_4h", "passed": macro_pass, "value": macro_regime}),
            json!({
                "gate": "model",
                "passed": model_pass,
                "value": {"p_win": p_win, "uncertainty": uncertainty, "threshold": threshold},
            }),
            json!({"gate": "guardrails", "passed": guardrails_pass}),
        ];

        let allow_trade = macro_pass && model_pass && guardrails_pass;
        let qty = if allow_trade {
            trader
                .get("suggested_qty")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        } else {
            0.0
        };
        let action = if allow_trade { "BUY" } else { "NO_TRADE" };

        let reason = gate_results
            .iter()
            .map(|row| {
                let gate = row.get("gate").and_then(Value::as_str).unwrap_or("?");
                let passed = row.get("passed").and_then(Value::as_bool).unwrap_or(false);
                format!("{}={}", gate, if passed { "PASS" } else { "FAIL" })
            })
            .collect::<Vec<_>>()
            .join("; ");

        let mut plan = ActionPlan::new("trader.trade_plan", if allow_trade { 2 } else { 3 }, reason);
        plan.domain = "trader".into();
        plan.expected_impact = if allow_trade {
            (0.5 * p_win + 0.5 * assessment.score).clamp(0.0, 1.0)
        } else {
            0.5
        };
        plan.metadata.insert(
            "action_payload".into(),
            json!({
                "type": "trader.order",
                "symbol": symbol,
                "action": action,
                "qty": qty,
            }),
        );
        plan.explain_section_mut("de").extend([
            ("selected_by_bandit".to_string(), json!(false)),
            ("final_profile".to_string(), json!("MACRO->MODEL->GUARDRAILS")),
            ("gate_results".to_string(), Value::Array(gate_results)),
            ("cci".to_string(), json!(cci.cci)),
        ]);
        Ok(plan)
    }
}
