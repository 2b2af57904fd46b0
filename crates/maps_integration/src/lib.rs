//! Capability interfaces for the external services the delivery backend leans
//! on: geocoding, route optimisation and manifest parsing.

use async_trait::async_trait;
use shared::{domain::LatLng, protocol::ManifestRow};

mod google;
mod manifest;

pub use google::GoogleMapsClient;
pub use manifest::SpreadsheetManifestParser;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteLeg {
    pub start_address: String,
    pub end_address: String,
    pub distance_text: String,
    pub distance_meters: u64,
    pub duration_text: String,
    pub duration_seconds: u64,
}

/// Result of a round trip from the origin through every waypoint.
/// `waypoint_order[i]` is the index into the submitted waypoints visited i-th;
/// `legs` has one more entry than the waypoints (the return leg).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptimizedRoute {
    pub waypoint_order: Vec<usize>,
    pub legs: Vec<RouteLeg>,
}

impl OptimizedRoute {
    pub fn total_distance_meters(&self) -> u64 {
        self.legs.iter().map(|leg| leg.distance_meters).sum()
    }

    pub fn total_duration_seconds(&self) -> u64 {
        self.legs.iter().map(|leg| leg.duration_seconds).sum()
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> anyhow::Result<LatLng>;
}

#[async_trait]
pub trait RouteOptimizer: Send + Sync {
    async fn optimize(
        &self,
        origin: LatLng,
        destination: LatLng,
        waypoints: &[LatLng],
    ) -> anyhow::Result<OptimizedRoute>;
}

pub trait ManifestParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> anyhow::Result<Vec<ManifestRow>>;
}
