use serde::Serialize;

const COUNTRY_BOILERPLATE: &[&str] = &[
    "usa",
    "u s a",
    "us",
    "u s",
    "united states",
    "united states of america",
    "the united states",
    "the united states of america",
];

const US_STATES: &[&str] = &[
    "alabama", "alaska", "arizona", "arkansas", "california", "colorado", "connecticut",
    "delaware", "florida", "georgia", "hawaii", "idaho", "illinois", "indiana", "iowa",
    "kansas", "kentucky", "louisiana", "maine", "maryland", "massachusetts", "michigan",
    "minnesota", "mississippi", "missouri", "montana", "nebraska", "nevada",
    "new hampshire", "new jersey", "new mexico", "new york", "north carolina",
    "north dakota", "ohio", "oklahoma", "oregon", "pennsylvania", "rhode island",
    "south carolina", "south dakota", "tennessee", "texas", "utah", "vermont", "virginia",
    "washington", "west virginia", "wisconsin", "wyoming", "district of columbia",
];

const COUNTRIES: &[&str] = &[
    "usa", "us", "u s a", "united states", "united states of america", "america",
    "canada", "mexico", "england", "scotland", "wales", "ireland", "northern ireland",
    "united kingdom", "uk", "great britain", "germany", "prussia", "france", "italy",
    "spain", "portugal", "netherlands", "holland", "belgium", "switzerland", "austria",
    "hungary", "poland", "russia", "norway", "sweden", "denmark", "finland", "africa",
    "europe", "unknown",
];

/// Outcome of normalizing a raw place string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum NormalizedPlace {
    Empty,
    Key(String),
}

impl NormalizedPlace {
    pub fn key(&self) -> Option<&str> {
        match self {
            NormalizedPlace::Empty => None,
            NormalizedPlace::Key(key) => Some(key.as_str()),
        }
    }
}

pub fn classify(raw: &str) -> NormalizedPlace {
    let key = normalize(raw);
    if key.is_empty() {
        NormalizedPlace::Empty
    } else {
        NormalizedPlace::Key(key)
    }
}

/// Canonical lookup key for a place string. Returns an empty string when
/// nothing meaningful remains; `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == ',' || ch == '\'' || ch == '-' {
                ch
            } else {
                ' '
            }
        })
        .collect();

    let mut segments: Vec<String> = cleaned
        .split(',')
        .map(collapse_whitespace)
        .filter(|segment| segment.chars().any(char::is_alphanumeric))
        .collect();

    while segments.len() > 1
        && segments
            .last()
            .map(|last| COUNTRY_BOILERPLATE.contains(&last.as_str()))
            .unwrap_or(false)
    {
        segments.pop();
    }

    segments.dedup();
    segments.join(", ")
}

/// A key is vague when it names only a state or a country.
pub fn is_vague(key: &str) -> bool {
    let segments = split_segments(key);
    match segments.as_slice() {
        [only] => US_STATES.contains(only) || COUNTRIES.contains(only),
        [state, country] => {
            US_STATES.contains(state)
                && (COUNTRIES.contains(country) || COUNTRY_BOILERPLATE.contains(country))
        }
        _ => false,
    }
}

pub fn split_segments(key: &str) -> Vec<&str> {
    key.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub fn first_segment(key: &str) -> Option<&str> {
    split_segments(key).into_iter().next()
}

/// Segments after the first, joined back into a key; used as an implicit
/// administrative hint.
pub fn trailing_segments(key: &str) -> Option<String> {
    let segments = split_segments(key);
    if segments.len() < 2 {
        return None;
    }
    Some(segments[1..].join(", "))
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
