// Tahlil Engine — Transaction Agents
//
// The six analysts that work bank-account movements: expenses, income,
// fees, budget, trends, and targeted investigation. Findings are computed
// from the evidence docs themselves; the model writes the narrative.

use super::findings::*;
use super::{Agent, AgentClass, FindingsInput};
use crate::engine::index::filter::{Field, Filter};
use crate::atoms::types::VectorDoc;
use chrono::{DateTime, Datelike, NaiveDate, Weekday};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map};
use std::collections::HashMap;

// ── Evidence decoding ──────────────────────────────────────────────────────

/// A transaction as reconstructed from an evidence doc. The doc text is
/// "date | description | kind amount [| balance b]".
struct EvidenceTxn<'a> {
    date: Option<NaiveDate>,
    description: &'a str,
    amount: Decimal,
    kind: &'a str,
    tags: &'a [String],
    balance: Option<Decimal>,
}

fn money(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or_default().round_dp(2)
}

fn decode(evidence: &[VectorDoc]) -> Vec<EvidenceTxn<'_>> {
    evidence
        .iter()
        .map(|doc| {
            let mut parts = doc.text.split(" | ");
            let _date_part = parts.next();
            let description = parts.next().unwrap_or("");
            let balance = parts
                .clone()
                .find(|p| p.starts_with("balance "))
                .and_then(|p| p.trim_start_matches("balance ").parse::<Decimal>().ok());
            EvidenceTxn {
                date: doc
                    .meta
                    .date_ts
                    .and_then(|ts| DateTime::from_timestamp(ts, 0))
                    .map(|dt| dt.date_naive()),
                description,
                amount: money(doc.meta.amount.unwrap_or(0.0)),
                kind: &doc.meta.kind,
                tags: &doc.meta.tags,
                balance,
            }
        })
        .collect()
}

fn month_count(txns: &[EvidenceTxn<'_>]) -> usize {
    let months: std::collections::HashSet<(i32, u32)> = txns
        .iter()
        .filter_map(|t| t.date)
        .map(|d| (d.year(), d.month()))
        .collect();
    months.len().max(1)
}

/// Spend groups: explicit category when present, else the leading word of
/// the description (bank narratives lead with the merchant or channel).
fn group_label(t: &EvidenceTxn<'_>, doc: &VectorDoc) -> String {
    if let Some(category) = &doc.meta.category {
        return category.clone();
    }
    t.description
        .split_whitespace()
        .next()
        .unwrap_or("other")
        .to_uppercase()
}

fn grouped_totals(evidence: &[VectorDoc], txns: &[EvidenceTxn<'_>]) -> Vec<CategoryTotal> {
    let mut groups: HashMap<String, (Decimal, usize)> = HashMap::new();
    for (t, doc) in txns.iter().zip(evidence.iter()) {
        let entry = groups.entry(group_label(t, doc)).or_default();
        entry.0 += t.amount;
        entry.1 += 1;
    }
    let mut totals: Vec<CategoryTotal> = groups
        .into_iter()
        .map(|(name, (total, count))| CategoryTotal { name, total, count })
        .collect();
    totals.sort_by(|a, b| b.total.cmp(&a.total));
    totals
}

fn txn_ref(t: &EvidenceTxn<'_>) -> TransactionRef {
    TransactionRef {
        date: t.date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
        description: t.description.to_string(),
        amount: t.amount,
    }
}

const FEE_TOKENS: [&str; 7] = ["fee", "charge", "commission", "penalty", "vat", "رسوم", "عمولة"];

fn is_fee(t: &EvidenceTxn<'_>) -> bool {
    t.tags.iter().any(|tag| tag == "fee")
        || FEE_TOKENS.iter().any(|tok| t.description.to_lowercase().contains(tok))
}

// ── Expense ────────────────────────────────────────────────────────────────

pub struct ExpenseAgent;

impl Agent for ExpenseAgent {
    fn name(&self) -> &'static str {
        "expense"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Transaction
    }
    fn persona(&self) -> &'static str {
        "You are an expense analyst for personal and business bank accounts."
    }
    fn mission(&self) -> &'static str {
        "- where the money goes: monthly spend and its biggest categories\n\
         - the largest single expenses and whether they look one-off or recurring\n\
         - concrete, realistic savings opportunities"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Kind, "debit")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let txns = decode(input.evidence);
        let total: Decimal = txns.iter().map(|t| t.amount).sum();
        let months = month_count(&txns);
        let monthly_total = (total / Decimal::from(months as u64)).round_dp(2);

        let mut top_categories = grouped_totals(input.evidence, &txns);
        top_categories.truncate(5);

        let largest = txns.iter().max_by(|a, b| a.amount.cmp(&b.amount)).map(txn_ref);

        let mut savings_ideas = Vec::new();
        if let Some(top) = top_categories.first() {
            if !total.is_zero() && top.total / total > Decimal::from_f64(0.3).unwrap_or_default() {
                savings_ideas.push(format!(
                    "{} is {}% of tracked spending — the single biggest lever",
                    top.name,
                    (top.total / total * Decimal::from(100)).round_dp(0)
                ));
            }
        }
        if txns.iter().any(is_fee) {
            savings_ideas.push("recurring bank fees detected — see the fee report".to_string());
        }

        AgentFindings::Expense(ExpenseFindings {
            monthly_total,
            top_categories,
            largest_expense: largest,
            savings_ideas,
        })
    }
}

// ── Income ─────────────────────────────────────────────────────────────────

pub struct IncomeAgent;

impl Agent for IncomeAgent {
    fn name(&self) -> &'static str {
        "income"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Transaction
    }
    fn persona(&self) -> &'static str {
        "You are an income analyst studying deposits and earnings patterns."
    }
    fn mission(&self) -> &'static str {
        "- total income and its sources over the period\n\
         - how stable and predictable the income is\n\
         - whether the account depends on a single stream"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Kind, "credit")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let txns = decode(input.evidence);
        let total: Decimal = txns.iter().map(|t| t.amount).sum();
        let sources = grouped_totals(input.evidence, &txns);
        let streams = sources.len();

        // Stability: 1 − coefficient of variation of credit amounts,
        // clamped to [0,1]. One regular salary scores near 1.
        let amounts: Vec<f64> = txns.iter().filter_map(|t| t.amount.to_string().parse().ok()).collect();
        let stability_score = if amounts.len() < 2 {
            if amounts.is_empty() { 0.0 } else { 1.0 }
        } else {
            let mean = amounts.iter().sum::<f64>() / amounts.len() as f64;
            let var = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / amounts.len() as f64;
            if mean.abs() < f64::EPSILON {
                0.0
            } else {
                (1.0 - var.sqrt() / mean).clamp(0.0, 1.0)
            }
        };

        AgentFindings::Income(IncomeFindings { total, sources, stability_score, streams })
    }
}

// ── Fee hunter ─────────────────────────────────────────────────────────────

pub struct FeeHunterAgent;

impl Agent for FeeHunterAgent {
    fn name(&self) -> &'static str {
        "fee_hunter"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Transaction
    }
    fn persona(&self) -> &'static str {
        "You are a fee hunter: you find every bank fee, charge and penalty the account pays."
    }
    fn mission(&self) -> &'static str {
        "- every fee, charge, commission and penalty in the data, totalled by type\n\
         - which fees are recurring versus one-off\n\
         - what could be avoided and roughly how much that saves"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new().eq(Field::Kind, "debit")
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let txns = decode(input.evidence);
        let fees: Vec<&EvidenceTxn<'_>> = txns.iter().filter(|t| is_fee(t)).collect();
        let total_fees: Decimal = fees.iter().map(|t| t.amount).sum();

        let mut by_type_totals: HashMap<String, Decimal> = HashMap::new();
        for fee in &fees {
            let token = FEE_TOKENS
                .iter()
                .find(|tok| fee.description.to_lowercase().contains(*tok))
                .copied()
                .unwrap_or("fee");
            *by_type_totals.entry(token.to_string()).or_default() += fee.amount;
        }
        let mut by_type = Map::new();
        for (token, amount) in by_type_totals {
            by_type.insert(token, json!(amount.to_string()));
        }

        // Recurring fees (same description seen more than once) are the
        // realistically avoidable share.
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for fee in &fees {
            *seen.entry(fee.description).or_default() += 1;
        }
        let savings_potential: Decimal = fees
            .iter()
            .filter(|f| seen.get(f.description).copied().unwrap_or(0) > 1)
            .map(|f| f.amount)
            .sum();

        AgentFindings::FeeHunter(FeeFindings { total_fees, by_type, savings_potential })
    }
}

// ── Budget advisor ─────────────────────────────────────────────────────────

pub struct BudgetAdvisorAgent;

impl Agent for BudgetAdvisorAgent {
    fn name(&self) -> &'static str {
        "budget_advisor"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Transaction
    }
    fn persona(&self) -> &'static str {
        "You are a pragmatic budget advisor looking at the whole account."
    }
    fn mission(&self) -> &'static str {
        "- net cash flow: money in versus money out\n\
         - overall financial health and, if spending exceeds income, the runway\n\
         - three specific recommendations ranked by impact"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new()
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let txns = decode(input.evidence);
        let debits: Decimal = txns.iter().filter(|t| t.kind == "debit").map(|t| t.amount).sum();
        let credits: Decimal = txns.iter().filter(|t| t.kind == "credit").map(|t| t.amount).sum();
        let net_flow = credits - debits;
        let months = Decimal::from(month_count(&txns) as u64);

        // Runway: latest known balance over average monthly burn, only
        // meaningful while the account runs at a deficit.
        let latest_balance = txns
            .iter()
            .filter(|t| t.balance.is_some())
            .max_by_key(|t| t.date)
            .and_then(|t| t.balance);
        let monthly_net = net_flow / months;
        let runway_months = match (latest_balance, monthly_net < Decimal::ZERO) {
            (Some(balance), true) => {
                let burn = -monthly_net;
                (balance / burn).round_dp(1).to_string().parse().ok()
            }
            _ => None,
        };

        let gross = credits + debits;
        let health_score = if gross.is_zero() {
            0.0
        } else {
            let ratio: f64 = (credits / gross).to_string().parse().unwrap_or(0.0);
            (ratio * 100.0).round()
        };

        let mut recommendations = Vec::new();
        if net_flow < Decimal::ZERO {
            recommendations.push("spending exceeds income — cut the largest category first".into());
        } else {
            recommendations.push("cash-flow positive — automate a monthly transfer to savings".into());
        }
        if txns.iter().any(is_fee) {
            recommendations.push("eliminate recurring account fees".into());
        }

        AgentFindings::Budget(BudgetFindings { net_flow, runway_months, health_score, recommendations })
    }
}

// ── Trend analyst ──────────────────────────────────────────────────────────

pub struct TrendAnalystAgent;

impl Agent for TrendAnalystAgent {
    fn name(&self) -> &'static str {
        "trend_analyst"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Transaction
    }
    fn persona(&self) -> &'static str {
        "You are a spending-pattern analyst looking for rhythms in account activity."
    }
    fn mission(&self) -> &'static str {
        "- how activity distributes across weekdays and across months\n\
         - growth or decline in spending over the period\n\
         - seasonal or habitual patterns worth knowing about"
    }
    fn evidence_filter(&self) -> Filter {
        Filter::new()
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let txns = decode(input.evidence);

        let mut weekday_totals: HashMap<Weekday, Decimal> = HashMap::new();
        let mut month_totals: std::collections::BTreeMap<String, Decimal> = Default::default();
        for t in txns.iter().filter(|t| t.kind == "debit") {
            let Some(date) = t.date else { continue };
            *weekday_totals.entry(date.weekday()).or_default() += t.amount;
            *month_totals.entry(date.format("%Y-%m").to_string()).or_default() += t.amount;
        }

        let mut by_weekday = Map::new();
        for (day, total) in &weekday_totals {
            by_weekday.insert(format!("{:?}", day), json!(total.to_string()));
        }
        let mut by_month = Map::new();
        for (month, total) in &month_totals {
            by_month.insert(month.clone(), json!(total.to_string()));
        }

        let mut seasonal_notes = Vec::new();
        if let Some((day, total)) = weekday_totals.iter().max_by(|a, b| a.1.cmp(b.1)) {
            seasonal_notes.push(format!("spending peaks on {:?} ({} total)", day, total));
        }

        AgentFindings::Trend(TrendFindings { by_weekday, by_month, seasonal_notes })
    }
}

// ── Transaction investigator ───────────────────────────────────────────────

pub struct TransactionInvestigatorAgent;

impl Agent for TransactionInvestigatorAgent {
    fn name(&self) -> &'static str {
        "transaction_investigator"
    }
    fn class(&self) -> AgentClass {
        AgentClass::Transaction
    }
    fn persona(&self) -> &'static str {
        "You are a transaction investigator: you find specific records, duplicates and anomalies."
    }
    fn mission(&self) -> &'static str {
        "- records matching what the user is looking for\n\
         - possible duplicate charges (same description and amount)\n\
         - amounts far outside the account's normal range"
    }
    fn evidence_filter(&self) -> Filter {
        // Query-derived filters are ANDed in by the chat driver; insights
        // mode inspects the whole workspace.
        Filter::new()
    }
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings {
        let txns = decode(input.evidence);

        let mut seen: HashMap<(String, String), Vec<&EvidenceTxn<'_>>> = HashMap::new();
        for t in &txns {
            seen.entry((t.description.to_string(), t.amount.to_string()))
                .or_default()
                .push(t);
        }
        let duplicates: Vec<TransactionRef> = seen
            .values()
            .filter(|group| group.len() > 1)
            .flat_map(|group| group.iter().map(|t| txn_ref(t)))
            .collect();

        // Anomalies: debit amounts beyond mean + 3σ.
        let debit_amounts: Vec<f64> = txns
            .iter()
            .filter(|t| t.kind == "debit")
            .filter_map(|t| t.amount.to_string().parse().ok())
            .collect();
        let anomalies = if debit_amounts.len() >= 3 {
            let mean = debit_amounts.iter().sum::<f64>() / debit_amounts.len() as f64;
            let sd = (debit_amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>()
                / debit_amounts.len() as f64)
                .sqrt();
            let threshold = money(mean + 3.0 * sd);
            txns.iter()
                .filter(|t| t.kind == "debit" && t.amount > threshold)
                .map(txn_ref)
                .collect()
        } else {
            Vec::new()
        };

        AgentFindings::Investigator(InvestigatorFindings {
            matches: txns.len(),
            duplicates,
            anomalies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::DocMeta;
    use crate::engine::agents::findings::AgentFindings;

    fn doc(date: &str, desc: &str, kind: &str, amount: f64, balance: Option<f64>) -> VectorDoc {
        let date_ts = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let mut text = format!("{} | {} | {} {}", date, desc, kind, amount);
        if let Some(b) = balance {
            text.push_str(&format!(" | balance {}", b));
        }
        VectorDoc {
            id: format!("{}-{}", desc, date),
            text,
            embedding: vec![],
            meta: DocMeta {
                upload_id: "up1".into(),
                user_id: "u1".into(),
                kind: kind.into(),
                date_ts: Some(date_ts),
                amount: Some(amount),
                category: None,
                tags: crate::engine::ingest::semantic_tags(desc),
            },
        }
    }

    #[test]
    fn test_expense_monthly_total_single_month() {
        let evidence = vec![
            doc("2025-01-05", "WALMART GROCERY", "debit", 150.0, None),
            doc("2025-01-10", "ELECTRIC BILL", "debit", 125.0, None),
        ];
        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::Expense(f) = ExpenseAgent.findings(&input) else {
            panic!("wrong variant");
        };
        assert_eq!(f.monthly_total, Decimal::from_f64(275.0).unwrap());
        assert_eq!(f.largest_expense.unwrap().description, "WALMART GROCERY");
    }

    #[test]
    fn test_expense_monthly_total_averages_across_months() {
        let evidence = vec![
            doc("2025-01-05", "A", "debit", 100.0, None),
            doc("2025-02-05", "B", "debit", 300.0, None),
        ];
        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::Expense(f) = ExpenseAgent.findings(&input) else {
            panic!("wrong variant");
        };
        assert_eq!(f.monthly_total, Decimal::from_f64(200.0).unwrap());
    }

    #[test]
    fn test_income_total_and_stability() {
        let evidence = vec![
            doc("2025-01-25", "SALARY ACME", "credit", 3000.0, None),
            doc("2025-02-25", "SALARY ACME", "credit", 3000.0, None),
        ];
        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::Income(f) = IncomeAgent.findings(&input) else {
            panic!("wrong variant");
        };
        assert_eq!(f.total, Decimal::from_f64(6000.0).unwrap());
        assert!(f.stability_score > 0.99, "regular salary should be stable");
        assert_eq!(f.streams, 1);
    }

    #[test]
    fn test_fee_hunter_totals_and_recurring_savings() {
        let evidence = vec![
            doc("2025-01-01", "MONTHLY ACCOUNT FEE", "debit", 25.0, None),
            doc("2025-02-01", "MONTHLY ACCOUNT FEE", "debit", 25.0, None),
            doc("2025-01-15", "TRANSFER PENALTY", "debit", 50.0, None),
            doc("2025-01-20", "GROCERIES", "debit", 200.0, None),
        ];
        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::FeeHunter(f) = FeeHunterAgent.findings(&input) else {
            panic!("wrong variant");
        };
        assert_eq!(f.total_fees, Decimal::from_f64(100.0).unwrap());
        // Only the recurring monthly fee counts as avoidable.
        assert_eq!(f.savings_potential, Decimal::from_f64(50.0).unwrap());
        assert!(f.by_type.contains_key("fee"));
    }

    #[test]
    fn test_budget_net_flow_and_runway() {
        let evidence = vec![
            doc("2025-01-05", "SALARY", "credit", 1000.0, Some(5000.0)),
            doc("2025-01-10", "RENT", "debit", 3000.0, Some(2000.0)),
        ];
        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::Budget(f) = BudgetAdvisorAgent.findings(&input) else {
            panic!("wrong variant");
        };
        assert_eq!(f.net_flow, Decimal::from_f64(-2000.0).unwrap());
        // balance 2000 / burn 2000 per month = 1 month
        assert_eq!(f.runway_months, Some(1.0));
        assert!(!f.recommendations.is_empty());
    }

    #[test]
    fn test_trend_weekday_totals() {
        // 2025-01-06 is a Monday.
        let evidence = vec![
            doc("2025-01-06", "A", "debit", 10.0, None),
            doc("2025-01-13", "B", "debit", 30.0, None),
            doc("2025-01-07", "C", "debit", 5.0, None),
        ];
        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::Trend(f) = TrendAnalystAgent.findings(&input) else {
            panic!("wrong variant");
        };
        let monday: Decimal = f.by_weekday["Mon"].as_str().unwrap().parse().unwrap();
        assert_eq!(monday, Decimal::from(40));
        let january: Decimal = f.by_month["2025-01"].as_str().unwrap().parse().unwrap();
        assert_eq!(january, Decimal::from(45));
        assert!(f.seasonal_notes[0].contains("Mon"));
    }

    #[test]
    fn test_investigator_finds_duplicates_and_anomalies() {
        let mut evidence = vec![
            doc("2025-01-05", "COFFEE SHOP", "debit", 18.0, None),
            doc("2025-01-05", "COFFEE SHOP", "debit", 18.0, None),
        ];
        for day in 1..=9 {
            evidence.push(doc(&format!("2025-02-0{}", day), "LUNCH", "debit", 20.0 + day as f64, None));
        }
        evidence.push(doc("2025-02-15", "LUXURY WATCH", "debit", 9000.0, None));

        let input = FindingsInput { evidence: &evidence, statement: None };
        let AgentFindings::Investigator(f) = TransactionInvestigatorAgent.findings(&input) else {
            panic!("wrong variant");
        };
        assert_eq!(f.duplicates.len(), 2, "both coffee charges are flagged");
        assert_eq!(f.anomalies.len(), 1);
        assert_eq!(f.anomalies[0].description, "LUXURY WATCH");
        assert_eq!(f.matches, evidence.len());
    }
}
