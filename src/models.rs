use serde::{Deserialize, Serialize};

pub mod source {
    pub const MANUAL: &str = "manual";
    pub const HISTORICAL: &str = "historical";
    pub const CACHE: &str = "cache";
    pub const DB: &str = "db";
    pub const DB_FUZZY: &str = "db-fuzzy";
    pub const GAZETTEER: &str = "gazetteer";
    pub const VAGUE: &str = "vague";
    pub const EMPTY: &str = "empty";
    pub const NONE: &str = "none";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Ok,
    Unresolved,
    ManualOverride,
    Historical,
    Vague,
    Empty,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Ok => "ok",
            ResolutionStatus::Unresolved => "unresolved",
            ResolutionStatus::ManualOverride => "manual_override",
            ResolutionStatus::Historical => "historical",
            ResolutionStatus::Vague => "vague",
            ResolutionStatus::Empty => "empty",
        }
    }

    /// Stored rows written as `failed` by older tooling read back as unresolved.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(ResolutionStatus::Ok),
            "unresolved" | "failed" => Some(ResolutionStatus::Unresolved),
            "manual_override" => Some(ResolutionStatus::ManualOverride),
            "historical" => Some(ResolutionStatus::Historical),
            "vague" => Some(ResolutionStatus::Vague),
            "empty" => Some(ResolutionStatus::Empty),
            _ => None,
        }
    }

    pub fn has_coordinates(&self) -> bool {
        matches!(
            self,
            ResolutionStatus::Ok | ResolutionStatus::ManualOverride | ResolutionStatus::Historical
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMetadata {
    pub country: Option<String>,
    pub admin1: Option<String>,
    pub admin2: Option<String>,
}

impl AdminMetadata {
    /// Reads a comma separated admin area from most to least specific:
    /// `county, state, country`.
    pub fn from_admin_area(area: &str) -> Self {
        let mut parts = area
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        match parts.len() {
            0 => Self::default(),
            1 => Self {
                admin1: parts.pop(),
                ..Self::default()
            },
            2 => {
                let admin1 = parts.pop();
                Self {
                    admin2: parts.pop(),
                    admin1,
                    country: None,
                }
            }
            _ => {
                let country = parts.pop();
                let admin1 = parts.pop();
                Self {
                    admin2: parts.pop(),
                    admin1,
                    country,
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.country.is_none() && self.admin1.is_none() && self.admin2.is_none()
    }
}

/// A coordinate answer produced by one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub coordinates: Coordinates,
    pub display_name: Option<String>,
    pub confidence: f64,
    pub source: String,
    pub admin: AdminMetadata,
}

impl Candidate {
    pub fn new(coordinates: Coordinates, confidence: f64, source: impl Into<String>) -> Self {
        Self {
            coordinates,
            display_name: None,
            confidence: confidence.clamp(0.0, 1.0),
            source: source.into(),
            admin: AdminMetadata::default(),
        }
    }

    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name.filter(|name| !name.trim().is_empty());
        self
    }

    pub fn with_admin(mut self, admin: AdminMetadata) -> Self {
        self.admin = admin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_admin_area_levels() {
        let county = AdminMetadata::from_admin_area("sunflower county, mississippi");
        assert_eq!(county.admin2.as_deref(), Some("sunflower county"));
        assert_eq!(county.admin1.as_deref(), Some("mississippi"));
        assert!(county.country.is_none());

        let full = AdminMetadata::from_admin_area("cook, illinois, usa");
        assert_eq!(full.country.as_deref(), Some("usa"));
        assert!(AdminMetadata::from_admin_area(" , ").is_empty());
    }

    #[test]
    fn status_tags_round_trip() {
        for status in [
            ResolutionStatus::Ok,
            ResolutionStatus::Unresolved,
            ResolutionStatus::ManualOverride,
            ResolutionStatus::Historical,
            ResolutionStatus::Vague,
            ResolutionStatus::Empty,
        ] {
            assert_eq!(ResolutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            ResolutionStatus::parse("failed"),
            Some(ResolutionStatus::Unresolved)
        );
    }

    #[test]
    fn clamps_candidate_confidence() {
        let candidate = Candidate::new(Coordinates::new(1.0, 2.0), 1.7, "test");
        assert_eq!(candidate.confidence, 1.0);
        assert!(!Coordinates::new(91.0, 0.0).is_valid());
    }
}
