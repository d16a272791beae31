use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

pub mod codec;

pub use codec::{export, import, CodecError, ExportDocument, EXPORT_FORMAT_VERSION};

pub const LATITUDE_RANGE: std::ops::RangeInclusive<f64> = -90.0..=90.0;
pub const LONGITUDE_RANGE: std::ops::RangeInclusive<f64> = -180.0..=180.0;
pub const RATING_RANGE: std::ops::RangeInclusive<f64> = 0.0..=5.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PlaceError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Closed set of place kinds. The code is what goes to disk and into exports;
/// display labels live with the presentation layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Category {
    Restaurant,
    Cafe,
    Bar,
    Bakery,
}

/// Spellings seen in data written before category codes existed, in match priority order.
const LEGACY_LABELS: [(Category, &[&str]); 4] = [
    (Category::Restaurant, &["restaurant", "restaurante", "jatetxe"]),
    (Category::Cafe, &["cafe", "café", "cafetería", "cafeteria", "kafetegi"]),
    (Category::Bar, &["bar", "taberna"]),
    (
        Category::Bakery,
        &["bakery", "panadería", "panaderia", "pastelería", "pasteleria", "okindegi"],
    ),
];

impl Category {
    pub const ALL: [Category; 4] = [Self::Restaurant, Self::Cafe, Self::Bar, Self::Bakery];

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Restaurant => "RESTAURANT",
            Self::Cafe => "CAFE",
            Self::Bar => "BAR",
            Self::Bakery => "BAKERY",
        }
    }

    /// Exact code lookup. Unknown codes fall back to `Restaurant`; callers must not
    /// expect unknown codes to round-trip.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        Self::parse(code).unwrap_or(Self::Restaurant)
    }

    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "RESTAURANT" => Some(Self::Restaurant),
            "CAFE" => Some(Self::Cafe),
            "BAR" => Some(Self::Bar),
            "BAKERY" => Some(Self::Bakery),
            _ => None,
        }
    }

    /// Resolve a free-text label (English, Spanish or Basque, any case) to a category.
    ///
    /// The first category with a spelling contained in the lowercased text wins, checked
    /// in the order restaurant, café, bar, bakery. Text matching nothing resolves to
    /// `Restaurant`. Codes are valid input too, so applying this to normalized data is a
    /// no-op.
    #[must_use]
    pub fn from_legacy_text(text: &str) -> Self {
        let lowered = text.to_lowercase();
        LEGACY_LABELS
            .iter()
            .find(|(_, spellings)| spellings.iter().any(|spelling| lowered.contains(spelling)))
            .map_or(Self::Restaurant, |(category, _)| *category)
    }

    /// Specialty label seeded into `cuisine_type` for rows that predate the column.
    #[must_use]
    pub fn default_cuisine(self) -> &'static str {
        match self {
            Self::Restaurant => "Cocina tradicional",
            Self::Cafe => "Café de especialidad",
            Self::Bar => "Pintxos",
            Self::Bakery => "Panadería artesanal",
        }
    }

    #[must_use]
    pub fn appearance(self) -> CategoryAppearance {
        match self {
            Self::Restaurant => CategoryAppearance {
                label_key: "category.restaurant",
                color_hex: "#E53935",
                icon: "restaurant",
            },
            Self::Cafe => CategoryAppearance {
                label_key: "category.cafe",
                color_hex: "#6D4C41",
                icon: "local_cafe",
            },
            Self::Bar => CategoryAppearance {
                label_key: "category.bar",
                color_hex: "#8E24AA",
                icon: "local_bar",
            },
            Self::Bakery => CategoryAppearance {
                label_key: "category.bakery",
                color_hex: "#FB8C00",
                icon: "bakery_dining",
            },
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_code(&raw))
    }
}

/// Marker styling for a category, kept out of persistence.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct CategoryAppearance {
    pub label_key: &'static str,
    pub color_hex: &'static str,
    pub icon: &'static str,
}

/// One catalogued place. Serde names match the export document (`lugares[]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Place {
    pub id: i64,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "descripcion", default)]
    pub description: String,
    #[serde(rename = "latitud")]
    pub latitude: f64,
    #[serde(rename = "longitud")]
    pub longitude: f64,
    #[serde(rename = "categoria")]
    pub category: Category,
    /// Epoch milliseconds.
    #[serde(rename = "fechaCreacion")]
    pub created_at: i64,
    #[serde(default)]
    pub rating: f64,
    #[serde(rename = "esFavorito", default)]
    pub is_favorite: bool,
    #[serde(rename = "tipoCocina", default)]
    pub cuisine_type: String,
}

impl Place {
    /// Unsaved place; the store assigns `id` and `created_at` on insert.
    #[must_use]
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64, category: Category) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            latitude,
            longitude,
            category,
            created_at: 0,
            rating: 0.0,
            is_favorite: false,
            cuisine_type: String::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = rating;
        self
    }

    #[must_use]
    pub fn with_favorite(mut self, is_favorite: bool) -> Self {
        self.is_favorite = is_favorite;
        self
    }

    #[must_use]
    pub fn with_cuisine_type(mut self, cuisine_type: impl Into<String>) -> Self {
        self.cuisine_type = cuisine_type.into();
        self
    }

    /// Caller-side input check. The store trusts what it is given and never calls this.
    ///
    /// # Errors
    /// Returns [`PlaceError::Validation`] for an empty name, or a coordinate or rating
    /// outside its inclusive range.
    pub fn validate(&self) -> Result<(), PlaceError> {
        if self.name.trim().is_empty() {
            return Err(PlaceError::Validation("name MUST be non-empty".to_string()));
        }

        if !LATITUDE_RANGE.contains(&self.latitude) {
            return Err(PlaceError::Validation(format!(
                "latitude MUST be in [-90, 90], got {}",
                self.latitude
            )));
        }

        if !LONGITUDE_RANGE.contains(&self.longitude) {
            return Err(PlaceError::Validation(format!(
                "longitude MUST be in [-180, 180], got {}",
                self.longitude
            )));
        }

        if !RATING_RANGE.contains(&self.rating) {
            return Err(PlaceError::Validation(format!(
                "rating MUST be in [0.0, 5.0], got {}",
                self.rating
            )));
        }

        Ok(())
    }
}

/// Milliseconds since the Unix epoch, the unit of `Place::created_at`.
#[must_use]
pub fn epoch_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
