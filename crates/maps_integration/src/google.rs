use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use shared::domain::LatLng;
use tracing::debug;
use url::Url;

use crate::{Geocoder, OptimizedRoute, RouteLeg, RouteOptimizer};

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/";
/// Directions API limit on intermediate waypoints per request.
pub const MAX_WAYPOINTS: usize = 25;

/// Geocoding and Directions client for the Google Maps web services.
#[derive(Clone)]
pub struct GoogleMapsClient {
    http: Client,
    api_key: String,
    base_url: Url,
}

impl GoogleMapsClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid maps base url '{base_url}'"))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build maps http client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid maps endpoint '{path}'"))
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    #[serde(default)]
    waypoint_order: Vec<usize>,
    legs: Vec<DirectionsLeg>,
}

#[derive(Debug, Deserialize)]
struct DirectionsLeg {
    distance: TextValue,
    duration: TextValue,
    #[serde(default)]
    start_address: String,
    #[serde(default)]
    end_address: String,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    text: String,
    value: u64,
}

fn check_status(service: &str, status: &str, error_message: Option<&str>) -> Result<()> {
    if status == "OK" {
        return Ok(());
    }
    match error_message {
        Some(message) => bail!("{service} request failed with status {status}: {message}"),
        None => bail!("{service} request failed with status {status}"),
    }
}

fn location_from_geocode(response: GeocodeResponse) -> Result<LatLng> {
    check_status("geocode", &response.status, response.error_message.as_deref())?;
    response
        .results
        .into_iter()
        .next()
        .map(|result| result.geometry.location)
        .ok_or_else(|| anyhow!("geocode response contained no results"))
}

fn route_from_directions(response: DirectionsResponse) -> Result<OptimizedRoute> {
    check_status("directions", &response.status, response.error_message.as_deref())?;
    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("directions response contained no routes"))?;

    Ok(OptimizedRoute {
        waypoint_order: route.waypoint_order,
        legs: route
            .legs
            .into_iter()
            .map(|leg| RouteLeg {
                start_address: leg.start_address,
                end_address: leg.end_address,
                distance_text: leg.distance.text,
                distance_meters: leg.distance.value,
                duration_text: leg.duration.text,
                duration_seconds: leg.duration.value,
            })
            .collect(),
    })
}

fn format_point(point: LatLng) -> String {
    format!("{},{}", point.lat, point.lng)
}

fn optimized_waypoints_param(waypoints: &[LatLng]) -> String {
    let mut param = String::from("optimize:true");
    for point in waypoints {
        param.push('|');
        param.push_str(&format_point(*point));
    }
    param
}

#[async_trait]
impl Geocoder for GoogleMapsClient {
    async fn geocode(&self, address: &str) -> Result<LatLng> {
        let response: GeocodeResponse = self
            .http
            .get(self.endpoint("maps/api/geocode/json")?)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let location = location_from_geocode(response)?;
        debug!(%address, lat = location.lat, lng = location.lng, "geocoded address");
        Ok(location)
    }
}

#[async_trait]
impl RouteOptimizer for GoogleMapsClient {
    async fn optimize(
        &self,
        origin: LatLng,
        destination: LatLng,
        waypoints: &[LatLng],
    ) -> Result<OptimizedRoute> {
        if waypoints.len() > MAX_WAYPOINTS {
            bail!(
                "route has {} waypoints; the directions service accepts at most {MAX_WAYPOINTS}",
                waypoints.len()
            );
        }

        let origin = format_point(origin);
        let destination = format_point(destination);
        let mut query = vec![
            ("origin", origin.as_str()),
            ("destination", destination.as_str()),
            ("mode", "driving"),
            ("departure_time", "now"),
            ("key", self.api_key.as_str()),
        ];
        let waypoints_param = optimized_waypoints_param(waypoints);
        if !waypoints.is_empty() {
            query.push(("waypoints", waypoints_param.as_str()));
        }

        let response: DirectionsResponse = self
            .http
            .get(self.endpoint("maps/api/directions/json")?)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let route = route_from_directions(response)?;
        debug!(
            waypoints = waypoints.len(),
            legs = route.legs.len(),
            "optimized delivery route"
        );
        Ok(route)
    }
}

#[cfg(test)]
#[path = "tests/google_tests.rs"]
mod tests;
