//! Presence queries over the live registry.
//!
//! Filters compose conjunctively: domain (case-insensitive match on the
//! part after `@`), required capabilities (`metadata.capabilities` must
//! contain every one), and a geo filter (haversine great-circle distance
//! against `metadata.location`).

use serde_json::Value;
use switchboard_protocol::{address_domain, NearSpec, PresenceEntry, PresenceQuerySpec};

use crate::connection::Connection;

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated presence query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceQuery {
    pub domain: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub near: Option<GeoFilter>,
}

/// Validated geo filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFilter {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

impl PresenceQuery {
    /// Validate a wire-shape query.
    ///
    /// # Errors
    ///
    /// Returns a static message for non-finite coordinates or a negative
    /// radius.
    pub fn from_spec(spec: PresenceQuerySpec) -> Result<Self, &'static str> {
        let near = match spec.near {
            Some(NearSpec {
                lat,
                lon,
                radius_km,
            }) => {
                if !lat.is_finite() || !lon.is_finite() || !radius_km.is_finite() {
                    return Err("near coordinates must be finite numbers");
                }
                if radius_km < 0.0 {
                    return Err("near.radius_km must be non-negative");
                }
                Some(GeoFilter {
                    lat,
                    lon,
                    radius_km,
                })
            }
            None => None,
        };

        Ok(Self {
            domain: spec.domain,
            capabilities: spec.capabilities,
            near,
        })
    }

    /// Whether a registered connection matches every supplied filter.
    #[must_use]
    pub fn matches(&self, address: &str, metadata: Option<&Value>) -> bool {
        if let Some(ref wanted) = self.domain {
            let Some(domain) = address_domain(address) else {
                return false;
            };
            if !domain.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }

        if let Some(ref required) = self.capabilities {
            let Some(have) = metadata
                .and_then(|m| m.get("capabilities"))
                .and_then(Value::as_array)
            else {
                return required.is_empty();
            };
            for cap in required {
                if !have.iter().any(|v| v.as_str() == Some(cap.as_str())) {
                    return false;
                }
            }
        }

        if let Some(filter) = self.near {
            let Some(location) = metadata.and_then(|m| m.get("location")) else {
                return false;
            };
            let (Some(lat), Some(lon)) = (
                location.get("lat").and_then(Value::as_f64),
                location.get("lon").and_then(Value::as_f64),
            ) else {
                return false;
            };
            if haversine_km(filter.lat, filter.lon, lat, lon) > filter.radius_km {
                return false;
            }
        }

        true
    }
}

/// Great-circle distance between two coordinates, in kilometres.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Run a query over all registered connections except the requester.
///
/// Results are sorted by address, which keeps the ordering stable within
/// one reply.
#[must_use]
pub fn run_query<'a>(
    query: &PresenceQuery,
    connections: impl Iterator<Item = &'a Connection>,
    requester: crate::connection::SessionId,
) -> Vec<PresenceEntry> {
    let mut entries: Vec<PresenceEntry> = connections
        .filter(|conn| conn.session_id != requester)
        .filter_map(|conn| {
            let address = conn.address.as_deref()?;
            if !query.matches(address, conn.metadata.as_ref()) {
                return None;
            }
            Some(PresenceEntry {
                address: address.to_string(),
                status: conn.status().as_str().to_string(),
                metadata: conn.metadata.clone(),
            })
        })
        .collect();
    entries.sort_by(|a, b| a.address.cmp(&b.address));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London is roughly 344 km.
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero() {
        assert!(haversine_km(10.0, 20.0, 10.0, 20.0) < 1e-9);
    }

    #[test]
    fn test_domain_filter_case_insensitive() {
        let query = PresenceQuery {
            domain: Some("Example.Com".into()),
            ..Default::default()
        };
        assert!(query.matches("a@example.com", None));
        assert!(!query.matches("a@other.com", None));
    }

    #[test]
    fn test_capability_subset() {
        let query = PresenceQuery {
            capabilities: Some(vec!["audio".into(), "video".into()]),
            ..Default::default()
        };
        let full = json!({"capabilities": ["audio", "video", "chat"]});
        let partial = json!({"capabilities": ["audio"]});

        assert!(query.matches("a@x.y", Some(&full)));
        assert!(!query.matches("a@x.y", Some(&partial)));
        assert!(!query.matches("a@x.y", None));
    }

    #[test]
    fn test_near_filter() {
        let query = PresenceQuery {
            near: Some(GeoFilter {
                lat: 48.8566,
                lon: 2.3522,
                radius_km: 400.0,
            }),
            ..Default::default()
        };
        let london = json!({"location": {"lat": 51.5074, "lon": -0.1278}});
        let tokyo = json!({"location": {"lat": 35.6762, "lon": 139.6503}});

        assert!(query.matches("a@x.y", Some(&london)));
        assert!(!query.matches("a@x.y", Some(&tokyo)));
        // No location metadata never matches a geo filter.
        assert!(!query.matches("a@x.y", Some(&json!({}))));
    }

    #[test]
    fn test_spec_validation() {
        let bad = PresenceQuerySpec {
            near: Some(NearSpec {
                lat: 0.0,
                lon: 0.0,
                radius_km: -1.0,
            }),
            ..Default::default()
        };
        assert!(PresenceQuery::from_spec(bad).is_err());

        let nan = PresenceQuerySpec {
            near: Some(NearSpec {
                lat: f64::NAN,
                lon: 0.0,
                radius_km: 1.0,
            }),
            ..Default::default()
        };
        assert!(PresenceQuery::from_spec(nan).is_err());
    }
}
