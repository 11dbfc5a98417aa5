use crate::models::{ParsedLineItem, ParsedReceipt};
use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

/// Confidence assigned to items matched by the positional heuristics; the
/// provider gives per-word scores, not per-item ones.
const ITEM_CONFIDENCE: f64 = 0.8;

/// How many leading non-empty lines are considered merchant candidates.
const MERCHANT_SCAN_LINES: usize = 5;

static MONEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$?\s*(\d+\.\d{2})").expect("money regex"));

/// `<name> <price>` with the price anchored at the end of the line.
static LINE_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*\S)\s+\$?\s*(\d+\.\d{2})\s*$").expect("line item regex"));

static NUMERIC_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,4})[/-](\d{1,2})[/-](\d{1,4})").expect("numeric date regex"));

static TEXTUAL_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z]{3,9})\s+(\d{1,2}),?\s+(\d{4})").expect("textual date regex"));

const TAX_KEYWORDS: &[&str] = &["sales tax", "tax", "gst", "hst", "pst"];
const TIP_KEYWORDS: &[&str] = &["tip", "gratuity", "service"];
const TOTAL_KEYWORDS: &[&str] = &["grand total", "total", "amount", "balance"];
const SUBTOTAL_KEYWORDS: &[&str] = &["subtotal", "sub total", "sub-total"];

/// Turn raw OCR text into a structured receipt. Pure and deterministic:
/// same text in, same structure out, no I/O anywhere.
pub fn parse_receipt_text(raw_text: &str) -> ParsedReceipt {
    let lines: Vec<&str> = raw_text.lines().map(|l| l.trim_end_matches('\r')).collect();

    let mut parsed = ParsedReceipt {
        merchant_name: extract_merchant(&lines),
        transaction_date: extract_date(&lines),
        ..ParsedReceipt::default()
    };

    // Single classification pass, fixed priority:
    // tax > tip > total > subtotal > line item.
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_lowercase();

        if contains_any(&lower, TAX_KEYWORDS) {
            if parsed.tax_amount.is_none() {
                parsed.tax_amount = extract_amount(trimmed);
            }
        } else if contains_any(&lower, TIP_KEYWORDS) {
            if parsed.tip_amount.is_none() {
                parsed.tip_amount = extract_amount(trimmed);
            }
        } else if contains_any(&lower, SUBTOTAL_KEYWORDS) {
            // "subtotal" contains "total" as a substring, so the subtotal
            // keyword set must win before the total set is consulted.
            if parsed.subtotal.is_none() {
                parsed.subtotal = extract_amount(trimmed);
            }
        } else if contains_any(&lower, TOTAL_KEYWORDS) {
            if parsed.total_amount.is_none() {
                parsed.total_amount = extract_amount(trimmed);
            }
        } else if let Some(item) = match_line_item(trimmed, idx + 1) {
            parsed.items.push(item);
        }
    }

    apply_derived_totals(&mut parsed);
    parsed
}

/// First of the leading non-empty lines that is neither a date nor a bare
/// number; falls back to the very first non-empty line.
fn extract_merchant(lines: &[&str]) -> Option<String> {
    let candidates: Vec<&str> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .take(MERCHANT_SCAN_LINES)
        .collect();

    for candidate in &candidates {
        if is_date_like(candidate) || is_bare_number(candidate) {
            continue;
        }
        return Some((*candidate).to_string());
    }
    candidates.first().map(|l| (*l).to_string())
}

fn extract_date(lines: &[&str]) -> Option<NaiveDate> {
    lines.iter().find_map(|line| try_parse_date(line.trim()))
}

/// Ordered date patterns: numeric D/M/Y, then Y/M/D, then textual
/// "Month D, Y". First successful parse wins.
fn try_parse_date(line: &str) -> Option<NaiveDate> {
    if let Some(caps) = NUMERIC_DATE_RE.captures(line) {
        let text = caps.get(0).map(|m| m.as_str())?;
        let normalized = text.replace('-', "/");
        for format in ["%d/%m/%Y", "%d/%m/%y", "%Y/%m/%d"] {
            if let Ok(date) = NaiveDate::parse_from_str(&normalized, format) {
                return Some(date);
            }
        }
    }

    if let Some(caps) = TEXTUAL_DATE_RE.captures(line) {
        let normalized = format!("{} {} {}", &caps[1], &caps[2], &caps[3]);
        for format in ["%B %d %Y", "%b %d %Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(&normalized, format) {
                return Some(date);
            }
        }
    }

    None
}

fn is_date_like(line: &str) -> bool {
    try_parse_date(line).is_some()
}

fn is_bare_number(line: &str) -> bool {
    let stripped = line.trim_start_matches('$').trim().replace(',', "");
    !stripped.is_empty() && stripped.parse::<f64>().is_ok()
}

fn contains_any(lower_line: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| lower_line.contains(kw))
}

/// First monetary amount in the line, `$` optional.
fn extract_amount(line: &str) -> Option<BigDecimal> {
    MONEY_RE
        .captures(line)
        .and_then(|caps| BigDecimal::from_str(&caps[1]).ok())
}

fn match_line_item(line: &str, line_number: usize) -> Option<ParsedLineItem> {
    let caps = LINE_ITEM_RE.captures(line)?;
    let name = caps[1].trim().trim_end_matches('$').trim().to_string();
    if name.is_empty() {
        return None;
    }

    // Keyword lines never count as items.
    let lower = line.to_lowercase();
    if contains_any(&lower, TAX_KEYWORDS)
        || contains_any(&lower, TIP_KEYWORDS)
        || contains_any(&lower, TOTAL_KEYWORDS)
        || contains_any(&lower, SUBTOTAL_KEYWORDS)
    {
        return None;
    }

    let price = BigDecimal::from_str(&caps[2]).ok()?;
    if price <= BigDecimal::zero() {
        return None;
    }

    Some(ParsedLineItem {
        name,
        price,
        quantity: 1,
        line_number: line_number as i32,
        confidence: ITEM_CONFIDENCE,
    })
}

/// Fill missing subtotal from the item sum, then missing total from
/// subtotal + tax + tip. Nothing is derived when no evidence was found
/// at all, so empty input stays all-None.
fn apply_derived_totals(parsed: &mut ParsedReceipt) {
    if parsed.subtotal.is_none() && !parsed.items.is_empty() {
        let sum = parsed.items.iter().fold(BigDecimal::zero(), |acc, i| {
            acc + &i.price * BigDecimal::from(i.quantity)
        });
        parsed.subtotal = Some(sum);
    }

    if parsed.total_amount.is_none() {
        let has_evidence = parsed.subtotal.is_some()
            || parsed.tax_amount.is_some()
            || parsed.tip_amount.is_some();
        if has_evidence {
            let total = parsed.subtotal.clone().unwrap_or_else(BigDecimal::zero)
                + parsed.tax_amount.clone().unwrap_or_else(BigDecimal::zero)
                + parsed.tip_amount.clone().unwrap_or_else(BigDecimal::zero);
            parsed.total_amount = Some(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn empty_input_yields_nothing() {
        for input in ["", "   ", "\n\n", " \n \r\n "] {
            let parsed = parse_receipt_text(input);
            assert!(parsed.items.is_empty(), "items for {:?}", input);
            assert!(parsed.merchant_name.is_none());
            assert!(parsed.transaction_date.is_none());
            assert!(parsed.subtotal.is_none());
            assert!(parsed.tax_amount.is_none());
            assert!(parsed.tip_amount.is_none());
            assert!(parsed.total_amount.is_none());
        }
    }

    #[test]
    fn walmart_scenario() {
        let text = "WALMART\nStore #1234\nMilk 2%  3.99\nBread  2.49\nSubtotal 6.48\nTax 0.45\nTotal 6.93";
        let parsed = parse_receipt_text(text);

        assert_eq!(parsed.merchant_name.as_deref(), Some("WALMART"));
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].name, "Milk 2%");
        assert_eq!(parsed.items[0].price, dec("3.99"));
        assert_eq!(parsed.items[0].quantity, 1);
        assert_eq!(parsed.items[1].name, "Bread");
        assert_eq!(parsed.items[1].price, dec("2.49"));
        assert_eq!(parsed.subtotal, Some(dec("6.48")));
        assert_eq!(parsed.tax_amount, Some(dec("0.45")));
        assert_eq!(parsed.total_amount, Some(dec("6.93")));
    }

    #[test]
    fn tax_keywords_capture_tax_not_items() {
        for (line, expected) in [
            ("Tax: $3.25", "3.25"),
            ("GST 1.99", "1.99"),
            ("HST 4.75", "4.75"),
            ("Sales Tax 0.50", "0.50"),
            ("PST 2.00", "2.00"),
        ] {
            let parsed = parse_receipt_text(line);
            assert_eq!(parsed.tax_amount, Some(dec(expected)), "line {:?}", line);
            assert!(parsed.items.is_empty(), "line {:?}", line);
        }
    }

    #[test]
    fn tip_and_total_and_subtotal_classification() {
        let text = "CAFE\nGratuity 2.00\nBalance 12.00\nSub-total 10.00";
        let parsed = parse_receipt_text(text);
        assert_eq!(parsed.tip_amount, Some(dec("2.00")));
        assert_eq!(parsed.total_amount, Some(dec("12.00")));
        assert_eq!(parsed.subtotal, Some(dec("10.00")));
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn zero_price_items_are_excluded() {
        let parsed = parse_receipt_text("SHOP\nFree sample 0.00\nCoffee 2.50");
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "Coffee");
    }

    #[test]
    fn line_numbers_follow_source_position() {
        let text = "SHOP\n\nCoffee 2.50\nDonut 1.25";
        let parsed = parse_receipt_text(text);
        assert_eq!(parsed.items[0].line_number, 3);
        assert_eq!(parsed.items[1].line_number, 4);
    }

    #[test]
    fn merchant_skips_dates_and_bare_numbers() {
        let text = "01/02/2024\n42.00\nJOE'S DINER\nCoffee 2.50";
        let parsed = parse_receipt_text(text);
        assert_eq!(parsed.merchant_name.as_deref(), Some("JOE'S DINER"));
    }

    #[test]
    fn merchant_falls_back_to_first_line() {
        let parsed = parse_receipt_text("12/01/2024\n5.00");
        assert_eq!(parsed.merchant_name.as_deref(), Some("12/01/2024"));
    }

    #[test]
    fn date_patterns_in_order() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(
            parse_receipt_text("SHOP\n15/03/2024").transaction_date,
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            parse_receipt_text("SHOP\n2024/03/15").transaction_date,
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            parse_receipt_text("SHOP\n2024-03-15").transaction_date,
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            parse_receipt_text("SHOP\nMarch 15, 2024").transaction_date,
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            parse_receipt_text("SHOP\nMar 15 2024").transaction_date,
            Some(d(2024, 3, 15))
        );
        assert_eq!(parse_receipt_text("SHOP\nno date here").transaction_date, None);
    }

    #[test]
    fn derived_subtotal_and_total() {
        // No explicit subtotal/total lines: derive both from items + tax.
        let parsed = parse_receipt_text("SHOP\nCoffee 2.50\nDonut 1.25\nTax 0.30");
        assert_eq!(parsed.subtotal, Some(dec("3.75")));
        assert_eq!(parsed.total_amount, Some(dec("4.05")));
    }

    #[test]
    fn derived_total_law_with_tip() {
        let parsed = parse_receipt_text("DINER\nSteak 20.00\nTip 3.00\nTax 1.50");
        let expected = parsed.subtotal.clone().unwrap()
            + parsed.tax_amount.clone().unwrap()
            + parsed.tip_amount.clone().unwrap();
        assert_eq!(parsed.total_amount, Some(expected));
    }

    #[test]
    fn explicit_total_is_not_overwritten() {
        let parsed = parse_receipt_text("SHOP\nCoffee 2.50\nTotal 9.99");
        assert_eq!(parsed.total_amount, Some(dec("9.99")));
    }

    #[test]
    fn parsing_is_idempotent() {
        let text = "WALMART\nMilk 3.99\nTax 0.45\nTotal 4.44";
        assert_eq!(parse_receipt_text(text), parse_receipt_text(text));
    }

    #[test]
    fn dollar_signs_are_accepted() {
        let parsed = parse_receipt_text("SHOP\nCoffee $2.50\nTotal $2.50");
        assert_eq!(parsed.items[0].price, dec("2.50"));
        assert_eq!(parsed.total_amount, Some(dec("2.50")));
    }
}
