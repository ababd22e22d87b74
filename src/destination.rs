//! Selectable VPN exit points

use serde::{Deserialize, Serialize};
use std::fmt;

/// A (country, city) pair the user can connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "countryId")]
    pub country_id: u32,
    #[serde(rename = "id")]
    pub city_id: u32,
}

impl Destination {
    pub fn new(country_id: u32, city_id: u32) -> Self {
        Self { country_id, city_id }
    }

    /// Key handed to the tunnel engines, `"{country}:{city}"`
    pub fn server_id(&self) -> String {
        format!("{}:{}", self.country_id, self.city_id)
    }

    /// Inverse of [`Destination::server_id`]
    pub fn from_server_id(server_id: &str) -> Option<Self> {
        let (country, city) = server_id.split_once(':')?;
        Some(Self::new(country.trim().parse().ok()?, city.trim().parse().ok()?))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "country {} / city {}", self.country_id, self.city_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id() {
        assert_eq!(Destination::new(3, 7).server_id(), "3:7");
        assert_eq!(Destination::new(0, 120).server_id(), "0:120");
    }

    #[test]
    fn test_from_server_id() {
        assert_eq!(Destination::from_server_id("3:7"), Some(Destination::new(3, 7)));
        assert_eq!(Destination::from_server_id("3"), None);
        assert_eq!(Destination::from_server_id("a:7"), None);
        assert_eq!(Destination::from_server_id(""), None);
    }

    #[test]
    fn test_stored_form() {
        let destination: Destination =
            serde_json::from_str(r#"{"id": 7, "countryId": 3}"#).unwrap();
        assert_eq!(destination, Destination::new(3, 7));
    }
}
