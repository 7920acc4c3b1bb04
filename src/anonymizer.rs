//! Category-specific masking and generalization. Every transform is
//! idempotent: re-anonymizing an already-masked value yields the same value.

const REDACTED: &str = "[REDACTED]";
const DATE_MASK: &str = "[DATE]";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum DataCategory {
    Email,
    Phone,
    Name,
    Address,
    Identifier,
    Numeric,
    Date,
}

/// Mask `value` according to its category.
pub fn anonymize(value: &str, category: DataCategory) -> String {
    match category {
        DataCategory::Email => mask_email(value),
        DataCategory::Phone => mask_phone(value),
        DataCategory::Name => mask_name(value),
        DataCategory::Address | DataCategory::Identifier => REDACTED.into(),
        DataCategory::Numeric => generalize_numeric(value),
        DataCategory::Date => generalize_date(value),
    }
}

/// Keep the first two local-part characters plus the domain.
fn mask_email(value: &str) -> String {
    let Some((local, domain)) = value.split_once('@') else {
        return REDACTED.into();
    };
    let stem: String = local.trim_end_matches('*').chars().take(2).collect();
    if stem.is_empty() {
        return REDACTED.into();
    }
    format!("{}***@{}", stem, domain)
}

/// Keep the last four digits.
fn mask_phone(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return REDACTED.into();
    }
    let last4: String = digits[digits.len() - 4..].iter().collect();
    format!("***-***-{}", last4)
}

/// First letter plus stars, per whitespace token.
fn mask_name(value: &str) -> String {
    let tokens: Vec<String> = value
        .split_whitespace()
        .filter_map(|tok| {
            let stem = tok.trim_end_matches('*');
            stem.chars().next().map(|c| format!("{}***", c))
        })
        .collect();
    if tokens.is_empty() {
        return REDACTED.into();
    }
    tokens.join(" ")
}

/// Round numbers into decade buckets ("34" → "30-39"). Values that do not
/// parse (including already-bucketed ones) pass through unchanged.
fn generalize_numeric(value: &str) -> String {
    match value.trim().parse::<f64>() {
        Ok(n) => {
            let base = (n / 10.0).floor() as i64 * 10;
            format!("{}-{}", base, base + 9)
        }
        Err(_) => value.into(),
    }
}

/// Generalize a date to its year and quarter ("2024-02-14" → "2024-Q1").
/// Already-generalized values and bare years pass through unchanged.
fn generalize_date(value: &str) -> String {
    let v = value.trim();
    if let Ok(date) = chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d") {
        use chrono::Datelike;
        let quarter = (date.month0() / 3) + 1;
        return format!("{}-Q{}", date.year(), quarter);
    }
    if is_year_quarter(v) || is_year(v) {
        return v.into();
    }
    DATE_MASK.into()
}

fn is_year(v: &str) -> bool {
    v.len() == 4 && v.chars().all(|c| c.is_ascii_digit())
}

fn is_year_quarter(v: &str) -> bool {
    let Some((year, q)) = v.split_once("-Q") else {
        return false;
    };
    is_year(year) && q.len() == 1 && q.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_masking() {
        assert_eq!(anonymize("john.doe@example.com", DataCategory::Email), "jo***@example.com");
        assert_eq!(anonymize("not-an-email", DataCategory::Email), REDACTED);
    }

    #[test]
    fn test_phone_masking() {
        assert_eq!(anonymize("+1 (555) 123-4567", DataCategory::Phone), "***-***-4567");
        assert_eq!(anonymize("12", DataCategory::Phone), REDACTED);
    }

    #[test]
    fn test_name_masking() {
        assert_eq!(anonymize("John Smith", DataCategory::Name), "J*** S***");
    }

    #[test]
    fn test_address_and_identifier_redacted() {
        assert_eq!(anonymize("1 Main St", DataCategory::Address), REDACTED);
        assert_eq!(anonymize("SSN-123", DataCategory::Identifier), REDACTED);
    }

    #[test]
    fn test_numeric_buckets() {
        assert_eq!(anonymize("34", DataCategory::Numeric), "30-39");
        assert_eq!(anonymize("7", DataCategory::Numeric), "0-9");
    }

    #[test]
    fn test_date_generalization() {
        assert_eq!(anonymize("2024-02-14", DataCategory::Date), "2024-Q1");
        assert_eq!(anonymize("2024-11-01", DataCategory::Date), "2024-Q4");
        assert_eq!(anonymize("yesterday", DataCategory::Date), DATE_MASK);
    }

    #[test]
    fn test_idempotent_for_every_category() {
        let cases = [
            ("john.doe@example.com", DataCategory::Email),
            ("j@example.com", DataCategory::Email),
            ("+1 555 123 4567", DataCategory::Phone),
            ("John Smith", DataCategory::Name),
            ("1 Main St", DataCategory::Address),
            ("ABC-123", DataCategory::Identifier),
            ("34", DataCategory::Numeric),
            ("2024-02-14", DataCategory::Date),
            ("garbage", DataCategory::Date),
        ];
        for (value, cat) in cases {
            let once = anonymize(value, cat);
            let twice = anonymize(&once, cat);
            assert_eq!(once, twice, "not idempotent for {:?} '{}'", cat, value);
        }
    }
}
