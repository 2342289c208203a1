// Tahlil Engine — Financial-Statement Agents
//
// The six analysts for corporate books: ratios, profitability, liquidity,
// multi-period trend, risk, and operating efficiency. Findings come from
// the parsed statement; the retrieved statement-line docs feed the
// prompts.

use super::findings::*;
use super::{Agent, AgentClass, FindingsInput};
use crate::atoms::types::{FinancialStatement, LineItem};
use crate::engine::index::filter::{Field, Filter};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

// ── Shared statement arithmetic ────────────────────────────────────────────

fn pct_change(item: &LineItem) -> Option<f64> {
    let current = item.current?;
    let prior = item.prior?;
    if prior.is_zero() {
        return None;
    }
    ((current - prior) / prior).to_f64()
}

fn ratio_map(entries: &[(&str, Option<f64>)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key.to_string(), value.map(Value::from).unwrap_or(Value::Null));
    }
    map
}

fn days_ratio(numerator: Option<Decimal>, denominator: Option<Decimal>) -> Option<f64> {
    let n = numerator?;
    let d = denominator?;
    if d.is_zero() {
        return None;
    }
    (n / d * Decimal::from(365)).round_dp(1).to_f64()
}

fn plain_ratio(numerator: Option<Decimal>, denominator: Option<Decimal>) -> Option<f64> {
    let n = numerator?;
    let d = denominator?;
    if d.is_zero() {
        return None;
    }
    (n / d).to_f64()
}

fn statement_of<'a>(input: &'a FindingsInput<'_>) -> Option<&'a FinancialStatement> {
    input.statement
}

// ── Ratio analyst ──────────────────────────────────────────────────────────

pub struct RatioAnalystAgent;

impl Agent for RatioAnalystAgent {
    fn name(&self) -> &'static str {
        "ratio_analyst"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Financial
    }
    fn persona(&self) -> &'static str {
        "You are a financial ratio analyst reading a company's statements."
    }
    fn mission(&self) -> &'static str {
        "- liquidity: current and quick ratios and what they say about short-term safety\n\
         - leverage: debt-to-equity and the balance-sheet structure\n\
         - profitability: margins and returns, benchmarked against healthy ranges"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Category, "ratios")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let Some(stmt) = statement_of(input) else {
            return AgentFindings::Ratio(RatioFindings::default());
        };
        let r = &stmt.ratios;
        AgentFindings::Ratio(RatioFindings {
            liquidity: ratio_map(&[
                ("current_ratio", r.current_ratio.current),
                ("quick_ratio", r.quick_ratio.current),
            ]),
            leverage: ratio_map(&[("debt_to_equity", r.debt_to_equity.current)]),
            profitability_block: ratio_map(&[
                ("gross_margin", r.gross_margin.current),
                ("net_margin", r.net_margin.current),
                ("roa", r.roa.current),
                ("roe", r.roe.current),
            ]),
        })
    }
}

// ── Profitability ──────────────────────────────────────────────────────────

pub struct ProfitabilityAgent;

impl Agent for ProfitabilityAgent {
    fn name(&self) -> &'static str {
        "profitability"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Financial
    }
    fn persona(&self) -> &'static str {
        "You are a profitability analyst focused on the income statement."
    }
    fn mission(&self) -> &'static str {
        "- margins at each level: gross, operating, net\n\
         - how profit moved against the prior period and why\n\
         - the quality of earnings: one-offs versus the operating core"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Category, "income_statement")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let Some(stmt) = statement_of(input) else {
            return AgentFindings::Profitability(ProfitabilityFindings::default());
        };
        let is = &stmt.income_statement;
        let r = &stmt.ratios;

        AgentFindings::Profitability(ProfitabilityFindings {
            margins: ratio_map(&[
                ("gross_margin", r.gross_margin.current),
                ("net_margin", r.net_margin.current),
                ("operating_margin", plain_ratio(is.operating_income.current, is.revenue.current)),
            ]),
            yoy_delta: ratio_map(&[
                ("revenue", pct_change(&is.revenue)),
                ("net_income", pct_change(&is.net_income)),
                ("gross_profit", pct_change(&is.gross_profit)),
            ]),
            // Without a depreciation line, operating income is the closest
            // available EBITDA stand-in.
            ebitda_est: is.operating_income.current,
        })
    }
}

// ── Liquidity ──────────────────────────────────────────────────────────────

pub struct LiquidityAgent;

impl Agent for LiquidityAgent {
    fn name(&self) -> &'static str {
        "liquidity"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Financial
    }
    fn persona(&self) -> &'static str {
        "You are a liquidity analyst judging whether the company can pay its near-term bills."
    }
    fn mission(&self) -> &'static str {
        "- working capital and its adequacy\n\
         - quick ratio: what is left when inventory cannot be sold in time\n\
         - how long cash is tied up in the operating cycle"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Category, "balance_sheet")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let Some(stmt) = statement_of(input) else {
            return AgentFindings::Liquidity(LiquidityFindings::default());
        };
        let assets = &stmt.balance_sheet.assets;
        let liabilities = &stmt.balance_sheet.liabilities;
        let is = &stmt.income_statement;

        let working_capital = match (assets.current.current, liabilities.current.current) {
            (Some(a), Some(l)) => Some(a - l),
            _ => None,
        };

        // Cash tied up: days sales outstanding plus days inventory held.
        let dso = days_ratio(assets.receivables.current, is.revenue.current);
        let dio = days_ratio(assets.inventory.current, is.cost_of_revenue.current);
        let cash_conversion = match (dso, dio) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };

        AgentFindings::Liquidity(LiquidityFindings {
            working_capital,
            quick_ratio: stmt.ratios.quick_ratio.current,
            cash_conversion,
        })
    }
}

// ── Financial trend ────────────────────────────────────────────────────────

pub struct FinTrendAgent;

impl Agent for FinTrendAgent {
    fn name(&self) -> &'static str {
        "fin_trend"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Financial
    }
    fn persona(&self) -> &'static str {
        "You are a trend analyst comparing the company's periods."
    }
    fn mission(&self) -> &'static str {
        "- year-over-year growth in revenue, profit and assets\n\
         - which lines improved, which deteriorated, and the likely drivers\n\
         - the trajectory if the current movement continues"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Kind, "financial_statement")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let Some(stmt) = statement_of(input) else {
            return AgentFindings::FinTrend(FinTrendFindings::default());
        };
        let is = &stmt.income_statement;
        let bs = &stmt.balance_sheet;

        let yoy_growth = ratio_map(&[
            ("revenue", pct_change(&is.revenue)),
            ("net_income", pct_change(&is.net_income)),
            ("total_assets", pct_change(&bs.assets.total)),
            ("total_equity", pct_change(&bs.equity.total)),
        ]);

        let mut seasonality = Vec::new();
        if let (Some(rev), Some(ni)) = (pct_change(&is.revenue), pct_change(&is.net_income)) {
            if ni < rev {
                seasonality
                    .push("profit is growing slower than revenue — margin compression".into());
            }
        }

        AgentFindings::FinTrend(FinTrendFindings { yoy_growth, seasonality })
    }
}

// ── Risk ───────────────────────────────────────────────────────────────────

pub struct RiskAgent;

impl Agent for RiskAgent {
    fn name(&self) -> &'static str {
        "risk"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Financial
    }
    fn persona(&self) -> &'static str {
        "You are a credit-risk analyst assessing the company's financial exposure."
    }
    fn mission(&self) -> &'static str {
        "- leverage and liquidity against common covenant thresholds\n\
         - an overall risk score with the factors driving it\n\
         - concentrations or exposures visible in the statements"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().any_of(
            Field::Category,
            vec!["ratios".to_string(), "balance_sheet".to_string()],
        )
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let Some(stmt) = statement_of(input) else {
            return AgentFindings::Risk(RiskFindings { risk_score: 50.0, ..Default::default() });
        };
        let r = &stmt.ratios;
        let cf = &stmt.cash_flow_statement;

        let mut risk_score: f64 = 20.0;
        let mut covenant_notes = Vec::new();
        let mut exposures = Vec::new();

        if let Some(de) = r.debt_to_equity.current {
            if de > 2.0 {
                risk_score += 30.0;
                covenant_notes.push(format!(
                    "debt-to-equity {:.2} is above the common 2.0 covenant ceiling",
                    de
                ));
                exposures.push("high leverage".into());
            } else if de > 1.0 {
                risk_score += 15.0;
            }
        }
        if let Some(cr) = r.current_ratio.current {
            if cr < 1.0 {
                risk_score += 30.0;
                covenant_notes.push(format!(
                    "current ratio {:.2} is below 1.0 — short-term obligations exceed liquid assets",
                    cr
                ));
                exposures.push("thin liquidity".into());
            } else if cr < 1.5 {
                risk_score += 10.0;
            }
        }
        if let Some(op) = cf.operating.current {
            if op < Decimal::ZERO {
                risk_score += 20.0;
                exposures.push("negative operating cash flow".into());
            }
        }
        if let Some(nm) = r.net_margin.current {
            if nm < 0.0 {
                risk_score += 20.0;
                exposures.push("loss-making".into());
            }
        }

        AgentFindings::Risk(RiskFindings {
            covenant_notes,
            risk_score: risk_score.min(100.0),
            exposures,
        })
    }
}

// ── Efficiency ─────────────────────────────────────────────────────────────

pub struct EfficiencyAgent;

impl Agent for EfficiencyAgent {
    fn name(&self) -> &'static str {
        "efficiency"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Financial
    }
    fn persona(&self) -> &'static str {
        "You are an operating-efficiency analyst: how hard do the assets work?"
    }
    fn mission(&self) -> &'static str {
        "- asset turnover: revenue generated per unit of assets\n\
         - inventory turnover and days sales outstanding\n\
         - where capital is idling and what better operators achieve"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().any_of(
            Field::Category,
            vec!["balance_sheet".to_string(), "income_statement".to_string()],
        )
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let Some(stmt) = statement_of(input) else {
            return AgentFindings::Efficiency(EfficiencyFindings::default());
        };
        let assets = &stmt.balance_sheet.assets;
        let is = &stmt.income_statement;

        AgentFindings::Efficiency(EfficiencyFindings {
            asset_turnover: stmt.ratios.asset_turnover.current,
            inventory_turnover: plain_ratio(is.cost_of_revenue.current, assets.inventory.current),
            dso: days_ratio(assets.receivables.current, is.revenue.current),
        })
    }
}
