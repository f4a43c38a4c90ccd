use std::sync::LazyLock;

use harvest_core::Price;
use regex::Regex;

const AMOUNT: &str = r"(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d{1,2}))?";

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\$\s*{AMOUNT}\s*(?:-|to)\s*\$?\s*{AMOUNT}")).expect("valid price range regex")
});
static SINGLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\$\s*{AMOUNT}")).expect("valid price regex"));

/// Classifies ticket price text. Empty text is free; so is anything that says
/// "free" or "no cost".
pub fn parse_price(text: &str) -> Price {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Price::Free;
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("free") || lower.contains("no cost") {
        return Price::Free;
    }
    let normalized = trimmed.replace(['\u{2013}', '\u{2014}'], "-");

    if let Some(caps) = RANGE_RE.captures(&normalized) {
        let min = amount(caps.get(1).map(|m| m.as_str()), caps.get(2).map(|m| m.as_str()));
        let max = amount(caps.get(3).map(|m| m.as_str()), caps.get(4).map(|m| m.as_str()));
        if let (Some(min), Some(max)) = (min, max) {
            return Price::Range { min, max };
        }
    }

    let singles = SINGLE_RE.captures_iter(&normalized).collect::<Vec<_>>();
    if let [caps] = singles.as_slice() {
        if let Some(value) = amount(caps.get(1).map(|m| m.as_str()), caps.get(2).map(|m| m.as_str())) {
            return Price::Fixed(value);
        }
    }

    Price::Unparsed(trimmed.to_string())
}

fn amount(whole: Option<&str>, cents: Option<&str>) -> Option<f64> {
    let whole = whole?.replace(',', "");
    let text = match cents {
        Some(c) => format!("{whole}.{c}"),
        None => whole,
    };
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_free_text_default_to_free() {
        assert_eq!(parse_price(""), Price::Free);
        assert_eq!(parse_price("   "), Price::Free);
        assert_eq!(parse_price("Free admission"), Price::Free);
        assert_eq!(parse_price("NO COST to attend"), Price::Free);
    }

    #[test]
    fn single_amount_is_fixed() {
        assert_eq!(parse_price("$45"), Price::Fixed(45.0));
        assert_eq!(parse_price("Tickets: $12.50"), Price::Fixed(12.5));
        assert_eq!(parse_price("$1,200"), Price::Fixed(1200.0));
    }

    #[test]
    fn ranges_are_variable() {
        let price = parse_price("$25-150");
        assert_eq!(price, Price::Range { min: 25.0, max: 150.0 });
        assert_eq!(
            serde_json_amount(&price),
            serde_json::json!({"type": "variable", "amount": "25-150"})
        );
        assert_eq!(parse_price("$20 – $35"), Price::Range { min: 20.0, max: 35.0 });
    }

    #[test]
    fn anything_else_keeps_raw_text() {
        assert_eq!(
            parse_price("$15 adv / $20 door"),
            Price::Unparsed("$15 adv / $20 door".to_string())
        );
        assert_eq!(parse_price("25 EUR"), Price::Unparsed("25 EUR".to_string()));
        assert_eq!(parse_price("Donation"), Price::Unparsed("Donation".to_string()));
    }

    fn serde_json_amount(price: &Price) -> serde_json::Value {
        serde_json::to_value(price).unwrap()
    }
}
