//! Curated city directory with nearest-neighbour and mention lookup.
//!
//! The directory is loaded once at startup, either from the built-in table or
//! from a YAML file of `{name, lat, lng, country?}` entries, and is shared
//! read-only for the rest of the process.

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, instrument};

use crate::utils::round_to;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default search radius for nearest-city lookups.
pub const DEFAULT_WITHIN_KM: f64 = 100.0;

/// A geographic anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    /// Display name, conventionally `"City, Country"`.
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl City {
    pub fn new(name: &str, lat: f64, lng: f64) -> Self {
        Self {
            name: name.to_string(),
            lat,
            lng,
            country: None,
        }
    }

    /// The part of the name before the first comma ("Toronto, Canada" -> "Toronto").
    pub fn short_name(&self) -> &str {
        self.name.split(',').next().unwrap_or(&self.name).trim()
    }

    /// Explicit country, else the part of the name after the first comma.
    pub fn country(&self) -> Option<String> {
        self.country.clone().or_else(|| {
            self.name
                .split_once(',')
                .map(|(_, rest)| rest.trim().to_string())
                .filter(|c| !c.is_empty())
        })
    }
}

/// Result of a nearest-city lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearestCity {
    #[serde(flatten)]
    pub city: City,
    /// Great-circle distance, rounded to one decimal.
    pub distance_km: f64,
}

#[derive(Debug, Error)]
pub enum CityError {
    #[error("failed to read city file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse city file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("city file contains no cities")]
    Empty,
}

/// Immutable set of curated cities.
#[derive(Debug, Clone)]
pub struct CityDirectory {
    cities: Vec<City>,
}

impl CityDirectory {
    pub fn new(cities: Vec<City>) -> Self {
        Self { cities }
    }

    /// The built-in list of 100 major world cities.
    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_CITIES
                .iter()
                .map(|(name, lat, lng)| City::new(name, *lat, *lng))
                .collect(),
        )
    }

    /// Load a YAML list of cities.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn from_yaml_file(path: &Path) -> Result<Self, CityError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let cities: Vec<City> = serde_yaml::from_str(&raw)?;
        if cities.is_empty() {
            return Err(CityError::Empty);
        }
        info!(count = cities.len(), "Loaded city directory");
        Ok(Self::new(cities))
    }

    pub fn cities(&self) -> &[City] {
        &self.cities
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }

    /// Case-insensitive lookup by full name or short name.
    pub fn find(&self, name: &str) -> Option<&City> {
        let wanted = name.trim();
        self.cities.iter().find(|c| {
            c.name.eq_ignore_ascii_case(wanted) || c.short_name().eq_ignore_ascii_case(wanted)
        })
    }

    /// The closest city to `(lat, lng)` if it lies within `within_km`.
    pub fn nearest(&self, lat: f64, lng: f64, within_km: f64) -> Option<NearestCity> {
        self.cities
            .iter()
            .map(|c| (c, haversine_km(lat, lng, c.lat, c.lng)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, d)| *d <= within_km)
            .map(|(c, d)| NearestCity {
                city: c.clone(),
                distance_km: round_to(d, 1),
            })
    }

    /// The first city whose short name appears as a whole word in `text`.
    pub fn mentioned_in(&self, text: &str) -> Option<&City> {
        let haystack = text.to_lowercase();
        self.cities
            .iter()
            .find(|c| contains_word(&haystack, &c.short_name().to_lowercase()))
    }

    /// A uniformly random city, used to place posts that carry no location.
    pub fn random(&self) -> Option<&City> {
        self.cities.choose(&mut rand::rng())
    }
}

/// Haversine great-circle distance between two lat/lng points in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

const BUILTIN_CITIES: &[(&str, f64, f64)] = &[
    ("New York, USA", 40.7128, -74.0060),
    ("Los Angeles, USA", 34.0522, -118.2437),
    ("Chicago, USA", 41.8781, -87.6298),
    ("Houston, USA", 29.7604, -95.3698),
    ("Phoenix, USA", 33.4484, -112.0740),
    ("Philadelphia, USA", 39.9526, -75.1652),
    ("San Antonio, USA", 29.4241, -98.4936),
    ("San Diego, USA", 32.7157, -117.1611),
    ("Dallas, USA", 32.7767, -96.7970),
    ("San Jose, USA", 37.3382, -121.8863),
    ("Toronto, Canada", 43.6532, -79.3832),
    ("Montreal, Canada", 45.5017, -73.5673),
    ("Vancouver, Canada", 49.2827, -123.1207),
    ("Mexico City, Mexico", 19.4326, -99.1332),
    ("Guadalajara, Mexico", 20.6597, -103.3496),
    ("Buenos Aires, Argentina", -34.6037, -58.3816),
    ("São Paulo, Brazil", -23.5505, -46.6333),
    ("Rio de Janeiro, Brazil", -22.9068, -43.1729),
    ("Lima, Peru", -12.0464, -77.0428),
    ("Santiago, Chile", -33.4489, -70.6693),
    ("Bogotá, Colombia", 4.7110, -74.0721),
    ("Caracas, Venezuela", 10.4806, -66.9036),
    ("Panama City, Panama", 8.9824, -79.5199),
    ("Quito, Ecuador", -0.1807, -78.4678),
    ("Callao/Lima Port, Peru", -12.0433, -77.0283),
    ("Dubai, UAE", 25.2048, 55.2708),
    ("Riyadh, Saudi Arabia", 24.7136, 46.6753),
    ("Istanbul, Turkey", 41.0082, 28.9784),
    ("London, UK", 51.5074, -0.1278),
    ("Paris, France", 48.8566, 2.3522),
    ("Berlin, Germany", 52.5200, 13.4050),
    ("Rome, Italy", 41.9028, 12.4964),
    ("Madrid, Spain", 40.4168, -3.7038),
    ("Moscow, Russia", 55.7558, 37.6173),
    ("Saint Petersburg, Russia", 59.9343, 30.3351),
    ("Prague, Czechia", 50.0755, 14.4378),
    ("Vienna, Austria", 48.2082, 16.3738),
    ("Budapest, Hungary", 47.4979, 19.0402),
    ("Helsinki, Finland", 60.1699, 24.9384),
    ("Stockholm, Sweden", 59.3293, 18.0686),
    ("Oslo, Norway", 59.9139, 10.7522),
    ("Copenhagen, Denmark", 55.6761, 12.5683),
    ("Reykjavik, Iceland", 64.1466, -21.9426),
    ("Tokyo, Japan", 35.6895, 139.6917),
    ("Osaka, Japan", 34.6937, 135.5023),
    ("Seoul, South Korea", 37.5665, 126.9780),
    ("Shanghai, China", 31.2304, 121.4737),
    ("Beijing, China", 39.9042, 116.4074),
    ("Hong Kong", 22.3964, 114.1095),
    ("Singapore", 1.3521, 103.8198),
    ("Bangkok, Thailand", 13.7563, 100.5018),
    ("Kuala Lumpur, Malaysia", 3.1390, 101.6869),
    ("Jakarta, Indonesia", -6.2088, 106.8456),
    ("Manila, Philippines", 14.5995, 120.9842),
    ("Hanoi, Vietnam", 21.0278, 105.8342),
    ("Ho Chi Minh City, Vietnam", 10.8231, 106.6297),
    ("Delhi, India", 28.7041, 77.1025),
    ("Mumbai, India", 19.0760, 72.8777),
    ("Bengaluru, India", 12.9716, 77.5946),
    ("Chennai, India", 13.0827, 80.2707),
    ("Dhaka, Bangladesh", 23.8103, 90.4125),
    ("Karachi, Pakistan", 24.8607, 67.0011),
    ("Islamabad, Pakistan", 33.6844, 73.0479),
    ("Lahore, Pakistan", 31.5204, 74.3587),
    ("Kathmandu, Nepal", 27.7172, 85.3240),
    ("Colombo, Sri Lanka", 6.9271, 79.8612),
    ("Tel Aviv, Israel", 32.0853, 34.7818),
    ("Jerusalem, Israel", 31.7683, 35.2137),
    ("Cairo, Egypt", 30.0444, 31.2357),
    ("Nairobi, Kenya", -1.2864, 36.8172),
    ("Johannesburg, South Africa", -26.2041, 28.0473),
    ("Cape Town, South Africa", -33.9249, 18.4241),
    ("Lagos, Nigeria", 6.5244, 3.3792),
    ("Accra, Ghana", 5.6037, -0.1870),
    ("Casablanca, Morocco", 33.5731, -7.5898),
    ("Algiers, Algeria", 36.7538, 3.0588),
    ("Tunis, Tunisia", 36.8065, 10.1815),
    ("Addis Ababa, Ethiopia", 9.0054, 38.7636),
    ("Kampala, Uganda", 0.3476, 32.5825),
    ("Dar es Salaam, Tanzania", -6.7924, 39.2083),
    ("Melbourne, Australia", -37.8136, 144.9631),
    ("Sydney, Australia", -33.8688, 151.2093),
    ("Brisbane, Australia", -27.4698, 153.0251),
    ("Perth, Australia", -31.9523, 115.8613),
    ("Auckland, New Zealand", -36.8485, 174.7633),
    ("Wellington, New Zealand", -41.2865, 174.7762),
    ("Barcelona, Spain", 41.3851, 2.1734),
    ("Amsterdam, Netherlands", 52.3676, 4.9041),
    ("Frankfurt, Germany", 50.1109, 8.6821),
    ("Hamburg, Germany", 53.5511, 9.9937),
    ("Valencia, Spain", 39.4699, -0.3763),
    ("Glasgow, UK", 55.8642, -4.2518),
    ("Edinburgh, UK", 55.9533, -3.1883),
    ("Porto, Portugal", 41.1579, -8.6291),
    ("Zagreb, Croatia", 45.8150, 15.9819),
    ("Sofia, Bulgaria", 42.6977, 23.3219),
    ("Belgrade, Serbia", 44.7866, 20.4489),
    ("Sarajevo, Bosnia & Herzegovina", 43.8563, 18.4131),
    ("Tallinn, Estonia", 59.4370, 24.7536),
    ("Vilnius, Lithuania", 54.6872, 25.2797),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn toronto_only() -> CityDirectory {
        CityDirectory::new(vec![City::new("Toronto, Canada", 43.6532, -79.3832)])
    }

    #[test]
    fn test_nearest_city_toronto() {
        let dir = toronto_only();
        let hit = dir.nearest(43.70, -79.40, 50.0).expect("Toronto within 50km");
        assert_eq!(hit.city.name, "Toronto, Canada");
        // haversine gives 5.38 km for these coordinates
        assert_eq!(hit.distance_km, 5.4);
    }

    #[test]
    fn test_nearest_city_outside_radius() {
        let dir = toronto_only();
        assert!(dir.nearest(45.5017, -73.5673, 50.0).is_none());
    }

    #[test]
    fn test_nearest_serializes_flat() {
        let dir = toronto_only();
        let hit = dir.nearest(43.70, -79.40, 50.0).unwrap();
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["name"], "Toronto, Canada");
        assert!(json["distance_km"].is_number());
    }

    #[test]
    fn test_haversine_same_point_is_zero() {
        assert!(haversine_km(44.9778, -93.265, 44.9778, -93.265) < 0.001);
    }

    #[test]
    fn test_haversine_sf_to_la() {
        let dist = haversine_km(37.7749, -122.4194, 34.0522, -118.2437);
        assert!((dist - 559.0).abs() < 10.0, "got {dist}");
    }

    #[test]
    fn test_short_name_and_country() {
        let city = City::new("Toronto, Canada", 43.6532, -79.3832);
        assert_eq!(city.short_name(), "Toronto");
        assert_eq!(city.country().as_deref(), Some("Canada"));
        assert_eq!(City::new("Nowhere", 0.0, 0.0).country(), None);
    }

    #[test]
    fn test_find_by_short_name() {
        let dir = CityDirectory::builtin();
        assert_eq!(dir.find("toronto").unwrap().name, "Toronto, Canada");
        assert_eq!(dir.find("Toronto, Canada").unwrap().short_name(), "Toronto");
        assert!(dir.find("Atlantis").is_none());
    }

    #[test]
    fn test_mentioned_in_requires_whole_word() {
        let dir = toronto_only();
        assert!(dir.mentioned_in("Traffic in Toronto is awful today").is_some());
        assert!(dir.mentioned_in("TORONTO!").is_some());
        assert!(dir.mentioned_in("torontonians are lovely").is_none());
    }

    #[test]
    fn test_builtin_has_hundred_cities() {
        let dir = CityDirectory::builtin();
        assert_eq!(dir.len(), 100);
        assert!(dir.cities().iter().all(|c| (-90.0..=90.0).contains(&c.lat)));
        assert!(dir.random().is_some());
    }

    #[tokio::test]
    async fn test_from_yaml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cities.yaml");
        tokio::fs::write(
            &path,
            "- name: Toronto\n  lat: 43.6532\n  lng: -79.3832\n  country: Canada\n",
        )
        .await
        .unwrap();
        let dir = CityDirectory::from_yaml_file(&path).await.unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.cities()[0].country().as_deref(), Some("Canada"));
    }

    #[tokio::test]
    async fn test_from_yaml_file_rejects_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cities.yaml");
        tokio::fs::write(&path, "[]\n").await.unwrap();
        assert!(matches!(
            CityDirectory::from_yaml_file(&path).await,
            Err(CityError::Empty)
        ));
    }
}
