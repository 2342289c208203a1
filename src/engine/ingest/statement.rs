// Tahlil Engine — Financial Statement Parser
//
// Normalises two feed shapes into the FinancialStatement tree:
//   (a) XBRL-style Excel exports: many unnamed columns, sections located
//       by header text, figures positional (first numeric = current
//       period, second = prior);
//   (b) structured JSON from the vision processor.
//
// Derived ratios are computed wherever the source lacks them. A zero
// divisor yields None, never infinity; missing data stays None, never 0.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{FinancialStatement, LineItem, RatioItem};
use log::info;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;

// ── Shared numeric extraction ──────────────────────────────────────────────

/// Decimal from a JSON value: numbers directly, strings after separator
/// stripping. Null and "-" are missing, not zero.
fn json_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => cell_decimal(s),
        _ => None,
    }
}

fn cell_decimal(s: &str) -> Option<Decimal> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value } else { value })
}

// ── Vision JSON feed ───────────────────────────────────────────────────────

/// Build a statement from the vision processor's JSON. The walk is
/// tolerant: absent branches stay at their defaults, numeric strings are
/// accepted, and a flat `{current, prior}` object is the leaf shape.
pub fn from_vision_json(root: &Value) -> EngineResult<FinancialStatement> {
    if !root.is_object() {
        return Err(EngineError::IngestionParseFailed("statement JSON is not an object".into()));
    }

    let mut stmt = FinancialStatement::default();

    let info = &root["company_info"];
    stmt.company_info.name = info["name"].as_str().map(str::to_string);
    stmt.company_info.period_current = info["period_current"].as_str().map(str::to_string);
    stmt.company_info.period_prior = info["period_prior"].as_str().map(str::to_string);

    let item = |v: &Value| LineItem::new(json_decimal(&v["current"]), json_decimal(&v["prior"]));

    let bs = &root["balance_sheet"];
    stmt.balance_sheet.assets.cash = item(&bs["assets"]["cash"]);
    stmt.balance_sheet.assets.receivables = item(&bs["assets"]["receivables"]);
    stmt.balance_sheet.assets.inventory = item(&bs["assets"]["inventory"]);
    stmt.balance_sheet.assets.current = item(&bs["assets"]["current"]);
    stmt.balance_sheet.assets.non_current = item(&bs["assets"]["non_current"]);
    stmt.balance_sheet.assets.total = item(&bs["assets"]["total"]);
    stmt.balance_sheet.liabilities.current = item(&bs["liabilities"]["current"]);
    stmt.balance_sheet.liabilities.non_current = item(&bs["liabilities"]["non_current"]);
    stmt.balance_sheet.liabilities.total = item(&bs["liabilities"]["total"]);
    stmt.balance_sheet.equity.total = item(&bs["equity"]["total"]);

    let is = &root["income_statement"];
    stmt.income_statement.revenue = item(&is["revenue"]);
    stmt.income_statement.cost_of_revenue = item(&is["cost_of_revenue"]);
    stmt.income_statement.gross_profit = item(&is["gross_profit"]);
    stmt.income_statement.operating_expenses = item(&is["operating_expenses"]);
    stmt.income_statement.operating_income = item(&is["operating_income"]);
    stmt.income_statement.net_income = item(&is["net_income"]);

    let cf = &root["cash_flow_statement"];
    stmt.cash_flow_statement.operating = item(&cf["operating"]);
    stmt.cash_flow_statement.investing = item(&cf["investing"]);
    stmt.cash_flow_statement.financing = item(&cf["financing"]);
    stmt.cash_flow_statement.net_change = item(&cf["net_change"]);

    finalise(&mut stmt);
    Ok(stmt)
}

// ── Excel feed ─────────────────────────────────────────────────────────────

/// Line-item labels recognised in report rows, tried in order. The first
/// match wins, so more specific labels come before generic ones.
const EXCEL_LABELS: &[(&str, LabelTarget)] = &[
    ("total current assets", LabelTarget::AssetsCurrent),
    ("total non-current assets", LabelTarget::AssetsNonCurrent),
    ("total non current assets", LabelTarget::AssetsNonCurrent),
    ("total assets", LabelTarget::AssetsTotal),
    ("cash and cash equivalents", LabelTarget::Cash),
    ("cash and bank", LabelTarget::Cash),
    ("accounts receivable", LabelTarget::Receivables),
    ("trade receivables", LabelTarget::Receivables),
    ("inventories", LabelTarget::Inventory),
    ("inventory", LabelTarget::Inventory),
    ("total current liabilities", LabelTarget::LiabilitiesCurrent),
    ("total non-current liabilities", LabelTarget::LiabilitiesNonCurrent),
    ("total non current liabilities", LabelTarget::LiabilitiesNonCurrent),
    ("total liabilities", LabelTarget::LiabilitiesTotal),
    ("total equity", LabelTarget::EquityTotal),
    ("total shareholders' equity", LabelTarget::EquityTotal),
    ("cost of revenue", LabelTarget::CostOfRevenue),
    ("cost of sales", LabelTarget::CostOfRevenue),
    ("revenue", LabelTarget::Revenue),
    ("sales", LabelTarget::Revenue),
    ("gross profit", LabelTarget::GrossProfit),
    ("operating expenses", LabelTarget::OperatingExpenses),
    ("operating income", LabelTarget::OperatingIncome),
    ("operating profit", LabelTarget::OperatingIncome),
    ("net income", LabelTarget::NetIncome),
    ("net profit", LabelTarget::NetIncome),
    ("profit for the year", LabelTarget::NetIncome),
    ("net cash from operating activities", LabelTarget::CashOperating),
    ("net cash used in investing activities", LabelTarget::CashInvesting),
    ("net cash from financing activities", LabelTarget::CashFinancing),
    ("net change in cash", LabelTarget::CashNetChange),
];

#[derive(Debug, Clone, Copy)]
enum LabelTarget {
    Cash,
    Receivables,
    Inventory,
    AssetsCurrent,
    AssetsNonCurrent,
    AssetsTotal,
    LiabilitiesCurrent,
    LiabilitiesNonCurrent,
    LiabilitiesTotal,
    EquityTotal,
    Revenue,
    CostOfRevenue,
    GrossProfit,
    OperatingExpenses,
    OperatingIncome,
    NetIncome,
    CashOperating,
    CashInvesting,
    CashFinancing,
    CashNetChange,
}

pub fn parse_excel_statement(path: &Path) -> EngineResult<FinancialStatement> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook = open_workbook_auto(path)
        .map_err(|e| EngineError::IngestionParseFailed(format!("cannot open workbook: {}", e)))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| EngineError::IngestionParseFailed("workbook has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| EngineError::IngestionParseFailed(format!("cannot read sheet: {}", e)))?;

    let rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect();

    parse_report_rows(&rows)
}

/// Positional extraction over label + figure rows. Exposed separately so
/// the row pipeline is testable without a workbook on disk.
pub(crate) fn parse_report_rows(rows: &[Vec<String>]) -> EngineResult<FinancialStatement> {
    let mut stmt = FinancialStatement::default();
    let mut matched = 0usize;

    for row in rows {
        let Some(label_cell) = row.iter().find(|c| !c.trim().is_empty()) else {
            continue;
        };
        let label = label_cell.trim().to_lowercase();

        let Some((_, target)) = EXCEL_LABELS.iter().find(|(l, _)| label.starts_with(l)) else {
            // Company name heuristic: a leading text-only row before any
            // figures were seen.
            if matched == 0 && stmt.company_info.name.is_none() {
                let numeric_cells = row.iter().filter(|c| cell_decimal(c).is_some()).count();
                if numeric_cells == 0 && label.len() > 3 && !label.contains("statement") {
                    stmt.company_info.name = Some(label_cell.trim().to_string());
                }
            }
            continue;
        };

        // First numeric cell after the label is the current period, the
        // second the prior period.
        let mut figures = row
            .iter()
            .skip_while(|c| c.trim() != label_cell.trim())
            .skip(1)
            .filter_map(|c| cell_decimal(c));
        let item = LineItem::new(figures.next(), figures.next());
        if item.is_empty() {
            continue;
        }
        matched += 1;

        let slot = match target {
            LabelTarget::Cash => &mut stmt.balance_sheet.assets.cash,
            LabelTarget::Receivables => &mut stmt.balance_sheet.assets.receivables,
            LabelTarget::Inventory => &mut stmt.balance_sheet.assets.inventory,
            LabelTarget::AssetsCurrent => &mut stmt.balance_sheet.assets.current,
            LabelTarget::AssetsNonCurrent => &mut stmt.balance_sheet.assets.non_current,
            LabelTarget::AssetsTotal => &mut stmt.balance_sheet.assets.total,
            LabelTarget::LiabilitiesCurrent => &mut stmt.balance_sheet.liabilities.current,
            LabelTarget::LiabilitiesNonCurrent => &mut stmt.balance_sheet.liabilities.non_current,
            LabelTarget::LiabilitiesTotal => &mut stmt.balance_sheet.liabilities.total,
            LabelTarget::EquityTotal => &mut stmt.balance_sheet.equity.total,
            LabelTarget::Revenue => &mut stmt.income_statement.revenue,
            LabelTarget::CostOfRevenue => &mut stmt.income_statement.cost_of_revenue,
            LabelTarget::GrossProfit => &mut stmt.income_statement.gross_profit,
            LabelTarget::OperatingExpenses => &mut stmt.income_statement.operating_expenses,
            LabelTarget::OperatingIncome => &mut stmt.income_statement.operating_income,
            LabelTarget::NetIncome => &mut stmt.income_statement.net_income,
            LabelTarget::CashOperating => &mut stmt.cash_flow_statement.operating,
            LabelTarget::CashInvesting => &mut stmt.cash_flow_statement.investing,
            LabelTarget::CashFinancing => &mut stmt.cash_flow_statement.financing,
            LabelTarget::CashNetChange => &mut stmt.cash_flow_statement.net_change,
        };
        if slot.is_empty() {
            *slot = item;
        }
    }

    if matched == 0 {
        return Err(EngineError::IngestionParseFailed(
            "no recognisable statement line items found".into(),
        ));
    }
    info!("[ingest] statement extraction matched {} line items", matched);

    finalise(&mut stmt);
    Ok(stmt)
}

// ── Completion: totals and ratios ──────────────────────────────────────────

fn add_opt(a: Option<Decimal>, b: Option<Decimal>) -> Option<Decimal> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn sub_opt(a: Option<Decimal>, b: Option<Decimal>) -> Option<Decimal> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}

/// numerator / denominator, missing or zero denominator → None.
fn ratio(n: Option<Decimal>, d: Option<Decimal>) -> Option<f64> {
    let n = n?;
    let d = d?;
    if d.is_zero() {
        return None;
    }
    (n / d).to_f64()
}

/// Fill missing totals from components, then compute every derivable
/// ratio the source did not supply.
pub(crate) fn finalise(stmt: &mut FinancialStatement) {
    // Totals from components where the report omitted them.
    let assets = &mut stmt.balance_sheet.assets;
    if assets.total.current.is_none() {
        assets.total.current = add_opt(assets.current.current, assets.non_current.current);
    }
    if assets.total.prior.is_none() {
        assets.total.prior = add_opt(assets.current.prior, assets.non_current.prior);
    }
    let liabilities = &mut stmt.balance_sheet.liabilities;
    if liabilities.total.current.is_none() {
        liabilities.total.current = add_opt(liabilities.current.current, liabilities.non_current.current);
    }
    if liabilities.total.prior.is_none() {
        liabilities.total.prior = add_opt(liabilities.current.prior, liabilities.non_current.prior);
    }
    let is = &mut stmt.income_statement;
    if is.gross_profit.current.is_none() {
        is.gross_profit.current = sub_opt(is.revenue.current, is.cost_of_revenue.current);
    }
    if is.gross_profit.prior.is_none() {
        is.gross_profit.prior = sub_opt(is.revenue.prior, is.cost_of_revenue.prior);
    }

    compute_ratios(stmt);
}

pub(crate) fn compute_ratios(stmt: &mut FinancialStatement) {
    let bs = &stmt.balance_sheet;
    let is = &stmt.income_statement;

    let per_period = |pick: &dyn Fn(&LineItem) -> Option<Decimal>| -> RatiosInput {
        RatiosInput {
            current_assets: pick(&bs.assets.current),
            inventory: pick(&bs.assets.inventory),
            total_assets: pick(&bs.assets.total),
            current_liabilities: pick(&bs.liabilities.current),
            total_liabilities: pick(&bs.liabilities.total),
            total_equity: pick(&bs.equity.total),
            revenue: pick(&is.revenue),
            gross_profit: pick(&is.gross_profit),
            net_income: pick(&is.net_income),
        }
    };

    let cur = per_period(&|li: &LineItem| li.current);
    let pri = per_period(&|li: &LineItem| li.prior);

    let fill = |slot: &mut RatioItem, f: &dyn Fn(&RatiosInput) -> Option<f64>| {
        if slot.current.is_none() {
            slot.current = f(&cur);
        }
        if slot.prior.is_none() {
            slot.prior = f(&pri);
        }
    };

    let r = &mut stmt.ratios;
    fill(&mut r.current_ratio, &|i| ratio(i.current_assets, i.current_liabilities));
    fill(&mut r.quick_ratio, &|i| {
        // Quick ratio approximates liquid assets as current − inventory;
        // missing inventory falls back to current assets alone.
        let liquid = match (i.current_assets, i.inventory) {
            (Some(a), Some(inv)) => Some(a - inv),
            (Some(a), None) => Some(a),
            _ => None,
        };
        ratio(liquid, i.current_liabilities)
    });
    fill(&mut r.debt_to_equity, &|i| ratio(i.total_liabilities, i.total_equity));
    fill(&mut r.gross_margin, &|i| ratio(i.gross_profit, i.revenue));
    fill(&mut r.net_margin, &|i| ratio(i.net_income, i.revenue));
    fill(&mut r.roa, &|i| ratio(i.net_income, i.total_assets));
    fill(&mut r.roe, &|i| ratio(i.net_income, i.total_equity));
    fill(&mut r.asset_turnover, &|i| ratio(i.revenue, i.total_assets));
}

struct RatiosInput {
    current_assets: Option<Decimal>,
    inventory: Option<Decimal>,
    total_assets: Option<Decimal>,
    current_liabilities: Option<Decimal>,
    total_liabilities: Option<Decimal>,
    total_equity: Option<Decimal>,
    revenue: Option<Decimal>,
    gross_profit: Option<Decimal>,
    net_income: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_vision_json_basic_extraction() {
        let v = json!({
            "company_info": { "name": "Al Noor Trading Co", "period_current": "FY2024", "period_prior": "FY2023" },
            "balance_sheet": {
                "assets": {
                    "current": { "current": 500000, "prior": 450000 },
                    "non_current": { "current": 1500000, "prior": 1400000 },
                    "inventory": { "current": 100000, "prior": null }
                },
                "liabilities": { "current": { "current": 250000, "prior": 300000 },
                                 "total": { "current": 1200000, "prior": 1150000 } },
                "equity": { "total": { "current": 800000, "prior": 700000 } }
            },
            "income_statement": {
                "revenue": { "current": 1000000, "prior": 900000 },
                "net_income": { "current": 150000, "prior": 120000 }
            },
            "cash_flow_statement": {}
        });

        let stmt = from_vision_json(&v).unwrap();
        assert_eq!(stmt.company_info.name.as_deref(), Some("Al Noor Trading Co"));
        // Total assets derived from components.
        assert_eq!(stmt.balance_sheet.assets.total.current, Some(dec("2000000")));
        // Missing prior inventory stays None, not zero.
        assert_eq!(stmt.balance_sheet.assets.inventory.prior, None);
    }

    #[test]
    fn test_derived_ratios_scenario() {
        // revenue 1,000,000 / net 150,000 / assets 2,000,000 / equity 800,000
        let v = json!({
            "balance_sheet": {
                "assets": { "total": { "current": 2000000 } },
                "equity": { "total": { "current": 800000 } }
            },
            "income_statement": {
                "revenue": { "current": 1000000 },
                "net_income": { "current": 150000 }
            }
        });
        let stmt = from_vision_json(&v).unwrap();
        let r = &stmt.ratios;
        assert!((r.net_margin.current.unwrap() - 0.15).abs() < 1e-6);
        assert!((r.roa.current.unwrap() - 0.075).abs() < 1e-6);
        assert!((r.roe.current.unwrap() - 0.1875).abs() < 1e-6);
        assert!((r.asset_turnover.current.unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_divisor_yields_none() {
        let v = json!({
            "balance_sheet": { "liabilities": { "current": { "current": 0 } },
                               "equity": { "total": { "current": 0 } } },
            "income_statement": { "net_income": { "current": 1000 } }
        });
        let stmt = from_vision_json(&v).unwrap();
        assert_eq!(stmt.ratios.roe.current, None);
        assert_eq!(stmt.ratios.current_ratio.current, None);
    }

    #[test]
    fn test_numeric_strings_with_separators() {
        let v = json!({
            "income_statement": {
                "revenue": { "current": "1,000,000.50", "prior": "(2,500)" }
            }
        });
        let stmt = from_vision_json(&v).unwrap();
        assert_eq!(stmt.income_statement.revenue.current, Some(dec("1000000.50")));
        assert_eq!(stmt.income_statement.revenue.prior, Some(dec("-2500")));
    }

    #[test]
    fn test_excel_rows_positional_extraction() {
        let rows: Vec<Vec<String>> = vec![
            vec!["Al Salam Manufacturing".into(), "".into(), "".into()],
            vec!["Statement of Financial Position".into(), "".into(), "".into()],
            vec!["".into(), "2024".into(), "2023".into()],
            vec!["Cash and cash equivalents".into(), "120,000".into(), "95,000".into()],
            vec!["Inventories".into(), "80,000".into(), "70,000".into()],
            vec!["Total current assets".into(), "300,000".into(), "260,000".into()],
            vec!["Total assets".into(), "900,000".into(), "820,000".into()],
            vec!["Total current liabilities".into(), "150,000".into(), "140,000".into()],
            vec!["Total liabilities".into(), "400,000".into(), "380,000".into()],
            vec!["Total equity".into(), "500,000".into(), "440,000".into()],
            vec!["Revenue".into(), "750,000".into(), "680,000".into()],
            vec!["Net profit".into(), "90,000".into(), "75,000".into()],
        ];

        let stmt = parse_report_rows(&rows).unwrap();
        assert_eq!(stmt.company_info.name.as_deref(), Some("Al Salam Manufacturing"));
        assert_eq!(stmt.balance_sheet.assets.cash.current, Some(dec("120000")));
        assert_eq!(stmt.balance_sheet.assets.cash.prior, Some(dec("95000")));
        assert_eq!(stmt.balance_sheet.equity.total.current, Some(dec("500000")));
        // current_ratio = 300k / 150k
        assert!((stmt.ratios.current_ratio.current.unwrap() - 2.0).abs() < 1e-9);
        // quick_ratio = (300k − 80k) / 150k
        assert!((stmt.ratios.quick_ratio.current.unwrap() - (220.0 / 150.0)).abs() < 1e-9);
        // debt_to_equity = 400k / 500k
        assert!((stmt.ratios.debt_to_equity.current.unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_unrecognisable_report_is_parse_failure() {
        let rows: Vec<Vec<String>> = vec![vec!["hello".into(), "world".into()]];
        assert!(matches!(
            parse_report_rows(&rows),
            Err(EngineError::IngestionParseFailed(_))
        ));
    }

    #[test]
    fn test_total_specific_labels_not_shadowed() {
        // "Total current assets" must not be captured by "total assets".
        let rows: Vec<Vec<String>> = vec![
            vec!["Total current assets".into(), "10".into()],
            vec!["Revenue".into(), "5".into()],
        ];
        let stmt = parse_report_rows(&rows).unwrap();
        assert_eq!(stmt.balance_sheet.assets.current.current, Some(dec("10")));
        assert_eq!(stmt.balance_sheet.assets.total.current, Some(dec("10"))); // derived
    }
}
