use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EraBucket {
    #[serde(rename = "pre_1800")]
    Pre1800,
    #[serde(rename = "1800_1890")]
    From1800To1890,
    #[serde(rename = "1890_1950")]
    From1890To1950,
    #[serde(rename = "1950_2000")]
    From1950To2000,
    #[serde(rename = "2000_2025")]
    From2000To2025,
    #[serde(rename = "unknown")]
    Unknown,
}


impl EraBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            EraBucket::Pre1800 => "pre_1800",
            EraBucket::From1800To1890 => "1800_1890",
            EraBucket::From1890To1950 => "1890_1950",
            EraBucket::From1950To2000 => "1950_2000",
            EraBucket::From2000To2025 => "2000_2025",
            EraBucket::Unknown => "unknown",
        }
    }

    /// Unrecognized tags map to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pre_1800" => EraBucket::Pre1800,
            "1800_1890" => EraBucket::From1800To1890,
            "1890_1950" => EraBucket::From1890To1950,
            "1950_2000" => EraBucket::From1950To2000,
            "2000_2025" => EraBucket::From2000To2025,
            _ => EraBucket::Unknown,
        }
    }

    pub fn from_date_text(text: &str) -> Self {
        bucket(parse_year(text))
    }

    pub fn all() -> [EraBucket; 6] {
        [
            EraBucket::Pre1800,
            EraBucket::From1800To1890,
            EraBucket::From1890To1950,
            EraBucket::From1950To2000,
            EraBucket::From2000To2025,
            EraBucket::Unknown,
        ]
    }
}

pub fn bucket(year: Option<i32>) -> EraBucket {
    match year {
        None => EraBucket::Unknown,
        Some(y) if y < 1800 => EraBucket::Pre1800,
        Some(y) if y < 1890 => EraBucket::From1800To1890,
        Some(y) if y < 1950 => EraBucket::From1890To1950,
        Some(y) if y < 2000 => EraBucket::From1950To2000,
        Some(_) => EraBucket::From2000To2025,
    }
}

/// First run of three or four digits in a GEDCOM-style date ("ABT 1852",
/// "12 MAR 1901", "BET 1880 AND 1885").
pub fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if (3..=4).contains(&digits.len()) {
            return digits.parse().ok();
        }
        digits.clear();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_fixed_boundaries() {
        assert_eq!(bucket(Some(1799)), EraBucket::Pre1800);
        assert_eq!(bucket(Some(1800)), EraBucket::From1800To1890);
        assert_eq!(bucket(Some(1889)), EraBucket::From1800To1890);
        assert_eq!(bucket(Some(1890)), EraBucket::From1890To1950);
        assert_eq!(bucket(Some(1949)), EraBucket::From1890To1950);
        assert_eq!(bucket(Some(1950)), EraBucket::From1950To2000);
        assert_eq!(bucket(Some(1999)), EraBucket::From1950To2000);
        assert_eq!(bucket(Some(2000)), EraBucket::From2000To2025);
        assert_eq!(bucket(Some(2025)), EraBucket::From2000To2025);
        assert_eq!(bucket(None), EraBucket::Unknown);
    }

    #[test]
    fn bucketing_is_total() {
        for year in [i32::MIN, -500, 0, 1, 1066, 2026, 9999, i32::MAX] {
            let era = bucket(Some(year));
            assert!(EraBucket::all().contains(&era));
            assert_ne!(era, EraBucket::Unknown);
        }
        assert_eq!(bucket(Some(i32::MIN)), EraBucket::Pre1800);
        assert_eq!(bucket(Some(i32::MAX)), EraBucket::From2000To2025);
    }

    #[test]
    fn parses_gedcom_dates() {
        assert_eq!(parse_year("ABT 1852"), Some(1852));
        assert_eq!(parse_year("12 MAR 1901"), Some(1901));
        assert_eq!(parse_year("BET 1880 AND 1885"), Some(1880));
        assert_eq!(parse_year("unknown"), None);
        assert_eq!(parse_year("12345"), None);
        assert_eq!(EraBucket::from_date_text("about 1920"), EraBucket::From1890To1950);
        assert_eq!(EraBucket::from_date_text(""), EraBucket::Unknown);
    }

    #[test]
    fn round_trips_tags() {
        for era in EraBucket::all() {
            assert_eq!(EraBucket::parse(era.as_str()), era);
        }
        assert_eq!(EraBucket::parse("1700s"), EraBucket::Unknown);
    }
}
