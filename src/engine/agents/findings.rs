// Tahlil Engine — Agent Findings
//
// Key facts each agent reports next to its narrative summary. Internally
// a tagged sum with one variant per agent, serialised at the boundary as an
// open map with an `agent_name` discriminator, which is the shape the
// workspace store and the HTTP responses carry.
//
// Findings are computed deterministically from retrieved evidence and
// parsed statements, never from model output; the model only narrates.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Transaction-side findings ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub name: String,
    pub total: Decimal,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionRef {
    pub date: String,
    pub description: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpenseFindings {
    /// Average debit total per calendar month in evidence.
    pub monthly_total: Decimal,
    pub top_categories: Vec<CategoryTotal>,
    pub largest_expense: Option<TransactionRef>,
    pub savings_ideas: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomeFindings {
    pub total: Decimal,
    pub sources: Vec<CategoryTotal>,
    /// 0..1; higher when income arrives in regular amounts.
    pub stability_score: f64,
    pub streams: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeFindings {
    pub total_fees: Decimal,
    pub by_type: Map<String, Value>,
    pub savings_potential: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetFindings {
    /// Credits minus debits over the evidence window.
    pub net_flow: Decimal,
    pub runway_months: Option<f64>,
    /// 0..100.
    pub health_score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendFindings {
    pub by_weekday: Map<String, Value>,
    pub by_month: Map<String, Value>,
    pub seasonal_notes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvestigatorFindings {
    pub matches: usize,
    pub duplicates: Vec<TransactionRef>,
    pub anomalies: Vec<TransactionRef>,
}

// ── Financial-side findings ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatioFindings {
    pub liquidity: Map<String, Value>,
    pub leverage: Map<String, Value>,
    pub profitability_block: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfitabilityFindings {
    pub margins: Map<String, Value>,
    pub yoy_delta: Map<String, Value>,
    pub ebitda_est: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiquidityFindings {
    pub working_capital: Option<Decimal>,
    pub quick_ratio: Option<f64>,
    pub cash_conversion: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinTrendFindings {
    pub yoy_growth: Map<String, Value>,
    pub seasonality: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskFindings {
    pub covenant_notes: Vec<String>,
    /// 0..100, higher is riskier.
    pub risk_score: f64,
    pub exposures: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EfficiencyFindings {
    pub asset_turnover: Option<f64>,
    pub inventory_turnover: Option<f64>,
    pub dso: Option<f64>,
}

// ── The tagged sum ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum AgentFindings {
    Expense(ExpenseFindings),
    Income(IncomeFindings),
    FeeHunter(FeeFindings),
    Budget(BudgetFindings),
    Trend(TrendFindings),
    Investigator(InvestigatorFindings),
    Ratio(RatioFindings),
    Profitability(ProfitabilityFindings),
    Liquidity(LiquidityFindings),
    FinTrend(FinTrendFindings),
    Risk(RiskFindings),
    Efficiency(EfficiencyFindings),
}

impl AgentFindings {
    pub fn agent_name(&self) -> &'static str {
        match self {
            AgentFindings::Expense(_) => "expense",
            AgentFindings::Income(_) => "income",
            AgentFindings::FeeHunter(_) => "fee_hunter",
            AgentFindings::Budget(_) => "budget_advisor",
            AgentFindings::Trend(_) => "trend_analyst",
            AgentFindings::Investigator(_) => "transaction_investigator",
            AgentFindings::Ratio(_) => "ratio_analyst",
            AgentFindings::Profitability(_) => "profitability",
            AgentFindings::Liquidity(_) => "liquidity",
            AgentFindings::FinTrend(_) => "fin_trend",
            AgentFindings::Risk(_) => "risk",
            AgentFindings::Efficiency(_) => "efficiency",
        }
    }

    /// The open-map boundary shape, discriminated by `agent_name`.
    pub fn into_map(self) -> Map<String, Value> {
        let name = self.agent_name();
        let value = match self {
            AgentFindings::Expense(f) => serde_json::to_value(f),
            AgentFindings::Income(f) => serde_json::to_value(f),
            AgentFindings::FeeHunter(f) => serde_json::to_value(f),
            AgentFindings::Budget(f) => serde_json::to_value(f),
            AgentFindings::Trend(f) => serde_json::to_value(f),
            AgentFindings::Investigator(f) => serde_json::to_value(f),
            AgentFindings::Ratio(f) => serde_json::to_value(f),
            AgentFindings::Profitability(f) => serde_json::to_value(f),
            AgentFindings::Liquidity(f) => serde_json::to_value(f),
            AgentFindings::FinTrend(f) => serde_json::to_value(f),
            AgentFindings::Risk(f) => serde_json::to_value(f),
            AgentFindings::Efficiency(f) => serde_json::to_value(f),
        };

        let mut map = match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert("agent_name".into(), Value::String(name.into()));
        map
    }
}
