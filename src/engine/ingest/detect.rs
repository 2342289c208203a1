// Tahlil Engine — Document-Type Detector
//
// Classifies an upload as `transactions` or `financial_statement` before
// any parser runs. Deterministic and side-effect-free: (a) PDFs are
// classified from their first-page text, (b) spreadsheets from their sheet
// structure and keyword signals, (c) anything still ambiguous falls back
// to the filename.

use crate::atoms::constants::HEADER_SCAN_LINES;
use crate::atoms::error::EngineResult;
use crate::atoms::types::DocumentType;
use crate::engine::ingest::tabular::looks_like_transactions;
use log::info;
use std::path::Path;

/// Keywords that mark financial-report prose. Two or more hits classify.
const REPORT_KEYWORDS: [&str; 12] = [
    "balance sheet",
    "statement of financial position",
    "income statement",
    "statement of comprehensive income",
    "cash flow",
    "total assets",
    "total liabilities",
    "shareholders' equity",
    "total equity",
    "revenue",
    "net income",
    "net profit",
];

/// Keywords that mark a bank account statement.
const ACCOUNT_KEYWORDS: [&str; 8] = [
    "account statement",
    "opening balance",
    "closing balance",
    "withdrawal",
    "deposit",
    "transaction",
    "debit",
    "credit",
];

pub struct Detection {
    pub document_type: DocumentType,
    pub reason: String,
}

/// Classify a file from its bytes and original filename.
pub fn detect(path: &Path, original_filename: &str) -> EngineResult<Detection> {
    let lower = original_filename.to_lowercase();

    let detection = if lower.ends_with(".pdf") {
        detect_pdf(path).unwrap_or_else(|| classify_filename(original_filename))
    } else if lower.ends_with(".xls") || lower.ends_with(".xlsx") {
        detect_sheet(path)?.unwrap_or_else(|| classify_filename(original_filename))
    } else {
        detect_csv(path)?.unwrap_or_else(|| classify_filename(original_filename))
    };

    info!(
        "[ingest] detected {} for '{}' ({})",
        detection.document_type.as_str(),
        original_filename,
        detection.reason
    );
    Ok(detection)
}

// ── PDF: first-page text peek ──────────────────────────────────────────────

fn detect_pdf(path: &Path) -> Option<Detection> {
    let output = std::process::Command::new("pdftotext")
        .args(["-f", "1", "-l", "1"])
        .arg(path)
        .arg("-")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).to_lowercase();
    classify_text(&text)
}

/// Keyword-count classification over free text.
pub(crate) fn classify_text(text: &str) -> Option<Detection> {
    let report_hits = REPORT_KEYWORDS.iter().filter(|k| text.contains(*k)).count();
    let account_hits = ACCOUNT_KEYWORDS.iter().filter(|k| text.contains(*k)).count();

    if report_hits >= 2 && report_hits > account_hits {
        return Some(Detection {
            document_type: DocumentType::FinancialStatement,
            reason: format!("{} report keywords on first page", report_hits),
        });
    }
    if account_hits >= 2 {
        return Some(Detection {
            document_type: DocumentType::Transactions,
            reason: format!("{} account-statement keywords on first page", account_hits),
        });
    }
    None
}

// ── Spreadsheets: structure inspection ─────────────────────────────────────

fn detect_sheet(path: &Path) -> EngineResult<Option<Detection>> {
    use calamine::{open_workbook_auto, Reader};

    let Ok(mut workbook) = open_workbook_auto(path) else {
        return Ok(None);
    };
    let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
        return Ok(None);
    };
    let Ok(range) = workbook.worksheet_range(&sheet_name) else {
        return Ok(None);
    };

    let rows: Vec<Vec<String>> = range
        .rows()
        .take(HEADER_SCAN_LINES)
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect();

    Ok(classify_rows(&rows))
}

fn detect_csv(path: &Path) -> EngineResult<Option<Detection>> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);

    let rows: Vec<Vec<String>> = text
        .lines()
        .take(HEADER_SCAN_LINES)
        .map(|line| line.split([',', ';', '\t']).map(|c| c.trim().to_string()).collect())
        .collect();

    Ok(classify_rows(&rows))
}

/// Sheet-shape classification: a recognisable transaction header wins;
/// otherwise many unnamed leading columns plus report keywords mark an
/// XBRL-style financial export.
pub(crate) fn classify_rows(rows: &[Vec<String>]) -> Option<Detection> {
    if looks_like_transactions(rows) {
        return Some(Detection {
            document_type: DocumentType::Transactions,
            reason: "date + amount column header".into(),
        });
    }

    let joined = rows
        .iter()
        .flat_map(|r| r.iter())
        .map(|c| c.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let report_hits = REPORT_KEYWORDS.iter().filter(|k| joined.contains(*k)).count();

    let unnamed_leading = rows
        .iter()
        .filter(|r| r.len() >= 2 && r.iter().filter(|c| c.trim().is_empty()).count() >= r.len() / 2)
        .count();

    if report_hits >= 2 || (report_hits >= 1 && unnamed_leading >= 2) {
        return Some(Detection {
            document_type: DocumentType::FinancialStatement,
            reason: format!(
                "{} report keywords, {} sparse rows",
                report_hits, unnamed_leading
            ),
        });
    }
    None
}

// ── Filename fallback ──────────────────────────────────────────────────────

pub(crate) fn classify_filename(filename: &str) -> Detection {
    let lower = filename.to_lowercase();
    let financial = ["financial", "balance", "income", "annual", "quarterly", "report", "fs_"];
    if financial.iter().any(|k| lower.contains(k)) {
        return Detection {
            document_type: DocumentType::FinancialStatement,
            reason: "filename".into(),
        };
    }
    Detection { document_type: DocumentType::Transactions, reason: "filename fallback".into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(csv: &str) -> Vec<Vec<String>> {
        csv.lines()
            .map(|l| l.split(',').map(|c| c.trim().to_string()).collect())
            .collect()
    }

    #[test]
    fn test_transaction_header_wins() {
        let r = rows("Date,Description,Debit,Credit\n2025-01-01,X,5.00,");
        let d = classify_rows(&r).unwrap();
        assert_eq!(d.document_type, DocumentType::Transactions);
    }

    #[test]
    fn test_report_keywords_classify_statement() {
        let r = rows("Statement of Financial Position,,\nTotal assets,900,820\nTotal liabilities,400,380");
        let d = classify_rows(&r).unwrap();
        assert_eq!(d.document_type, DocumentType::FinancialStatement);
    }

    #[test]
    fn test_ambiguous_rows_are_none() {
        let r = rows("hello,world\nfoo,bar");
        assert!(classify_rows(&r).is_none());
    }

    #[test]
    fn test_first_page_text_classification() {
        let d = classify_text("consolidated balance sheet\ntotal assets 900\ntotal liabilities 400").unwrap();
        assert_eq!(d.document_type, DocumentType::FinancialStatement);

        let d = classify_text("account statement\nopening balance 100\nwithdrawal 50").unwrap();
        assert_eq!(d.document_type, DocumentType::Transactions);

        assert!(classify_text("an unrelated letter").is_none());
    }

    #[test]
    fn test_filename_fallback() {
        assert_eq!(
            classify_filename("annual_financial_report_2024.pdf").document_type,
            DocumentType::FinancialStatement
        );
        assert_eq!(
            classify_filename("alrajhi_account_jan.csv").document_type,
            DocumentType::Transactions
        );
    }
}
