//! Geolocation load balancing strategy.
//!
//! Picks the eligible server closest (great-circle distance) to the
//! client-supplied coordinate. Requests without a coordinate, pools where no
//! server declares a location, or nearest servers beyond the configured
//! fallback distance are served round robin instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::load_balancer::{
    backend::ServerRecord, round_robin::RoundRobin, LoadBalancer, SelectionContext,
};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Haversine distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, Default)]
pub struct Geolocation {
    fallback_distance_km: Option<f64>,
    fallback: RoundRobin,
}

impl Geolocation {
    pub fn new(fallback_distance_km: Option<f64>) -> Self {
        Self {
            fallback_distance_km,
            fallback: RoundRobin::new(),
        }
    }
}

impl LoadBalancer for Geolocation {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        let Some(origin) = ctx.location else {
            return self.fallback.next_server(servers, ctx);
        };

        let nearest = servers
            .iter()
            .filter_map(|s| s.location.map(|loc| (origin.distance_km(&loc), s)))
            .min_by(|(da, a), (db, b)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)));

        match nearest {
            Some((distance, server)) if self.fallback_distance_km.map_or(true, |max| distance <= max) => {
                Some(server.clone())
            }
            Some((distance, server)) => {
                tracing::debug!(
                    nearest = %server.id,
                    distance_km = distance,
                    "Nearest server beyond fallback distance, using round robin"
                );
                self.fallback.next_server(servers, ctx)
            }
            None => self.fallback.next_server(servers, ctx),
        }
    }

    fn name(&self) -> &'static str {
        "geolocation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::server_with;

    const BERLIN: GeoPoint = GeoPoint { latitude: 52.52, longitude: 13.405 };
    const NEW_YORK: GeoPoint = GeoPoint { latitude: 40.7128, longitude: -74.006 };

    #[test]
    fn test_haversine_distance() {
        let d = BERLIN.distance_km(&NEW_YORK);
        assert!((d - 6_385.0).abs() < 20.0, "got {d}");
        assert_eq!(BERLIN.distance_km(&BERLIN), 0.0);
    }

    #[test]
    fn test_picks_nearest_server() {
        let lb = Geolocation::new(None);
        let eu = server_with("eu", |s| s.location(50.11, 8.68));
        let us = server_with("us", |s| s.location(39.04, -77.49));
        let servers = vec![eu.clone(), us.clone()];

        let ctx = SelectionContext { location: Some(NEW_YORK), ..Default::default() };
        assert_eq!(lb.next_server(&servers, &ctx).unwrap().id, us.id);

        let ctx = SelectionContext { location: Some(BERLIN), ..Default::default() };
        assert_eq!(lb.next_server(&servers, &ctx).unwrap().id, eu.id);
    }

    #[test]
    fn test_falls_back_to_round_robin_without_coordinate() {
        let lb = Geolocation::new(None);
        let a = server_with("a", |s| s.location(50.11, 8.68));
        let b = server_with("b", |s| s);
        let servers = vec![a.clone(), b.clone()];
        let ctx = SelectionContext::default();

        assert_eq!(lb.next_server(&servers, &ctx).unwrap().id, a.id);
        assert_eq!(lb.next_server(&servers, &ctx).unwrap().id, b.id);
    }

    #[test]
    fn test_falls_back_beyond_distance() {
        let lb = Geolocation::new(Some(500.0));
        let us = server_with("us", |s| s.location(39.04, -77.49));
        let other = server_with("other", |s| s);
        let servers = vec![us, other.clone()];

        let ctx = SelectionContext { location: Some(BERLIN), ..Default::default() };
        let picks: Vec<_> = (0..2).map(|_| lb.next_server(&servers, &ctx).unwrap().id.clone()).collect();
        assert!(picks.contains(&other.id));
    }
}
