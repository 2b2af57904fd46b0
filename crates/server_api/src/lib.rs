use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use maps_integration::{Geocoder, ManifestParser, RouteOptimizer};
use shared::{
    domain::{Delivery, DeliveryId, DeliveryStatus, LatLng, NewDelivery, Role, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ApproveDeliveriesRequest, DeliveryFilter, ManifestUpload, OptimizedDeliveryRoute,
        ParsedManifest, RouteStop, SessionInfo, UpdateDeliveryStatusRequest, UpdateResult,
        UpdateUserRoleRequest, UploadDeliveryRequest,
    },
};
use storage::{ApprovalScope, Storage};
use tracing::{debug, error, info, warn};

pub mod token;

const DEPOT_LABEL: &str = "Warehouse";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub geocoder: Arc<dyn Geocoder>,
    pub route_optimizer: Arc<dyn RouteOptimizer>,
    pub manifest_parser: Arc<dyn ManifestParser>,
    /// Street address every optimized route starts and ends at.
    pub depot_address: String,
}

/// Identity attached to a request by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub role: Role,
}

pub async fn upload_delivery(
    ctx: &ApiContext,
    request: UploadDeliveryRequest,
) -> Result<DeliveryId, ApiError> {
    let details = request.details;
    if !valid_coordinate(details.latitude, 90.0) || !valid_coordinate(details.longitude, 180.0) {
        return Err(ApiError::validation(
            "latitude and longitude must be finite map coordinates",
        ));
    }

    let id = ctx
        .storage
        .create_delivery(&NewDelivery {
            details,
            delivery_status: request.delivery_status,
            approval: request.approval,
        })
        .await
        .map_err(|err| storage_failure("Error uploading data", err))?;
    info!(%id, "delivery uploaded");
    Ok(id)
}

pub async fn list_deliveries(
    ctx: &ApiContext,
    filter: &DeliveryFilter,
) -> Result<Vec<Delivery>, ApiError> {
    let records = ctx
        .storage
        .list_deliveries(filter)
        .await
        .map_err(|err| storage_failure("Error fetching form submissions", err))?;
    debug!(filtered = !filter.is_empty(), count = records.len(), "deliveries listed");
    Ok(records)
}

pub async fn update_delivery_status(
    ctx: &ApiContext,
    request: UpdateDeliveryStatusRequest,
) -> Result<UpdateResult, ApiError> {
    let order_number = non_blank(request.order_number.as_deref());
    let status = non_blank(request.delivery_status.as_deref());
    let (Some(order_number), Some(status)) = (order_number, status) else {
        return Err(ApiError::validation(
            "Order number and delivery status are required",
        ));
    };
    let status: DeliveryStatus = status
        .parse()
        .map_err(|err| ApiError::validation("Invalid delivery status").with_cause(err))?;

    let result = ctx
        .storage
        .update_delivery_status(order_number, status)
        .await
        .map_err(|err| storage_failure("Error updating delivery status", err))?
        .ok_or_else(|| ApiError::not_found("No delivery found with this order number"))?;
    info!(
        order_number,
        to = %status,
        modified = result.modified_count,
        "delivery status updated"
    );
    Ok(result)
}

/// Approves the requested deliveries that are delivered and not yet approved.
/// Returns how many records changed.
pub async fn approve_deliveries(
    ctx: &ApiContext,
    request: ApproveDeliveriesRequest,
) -> Result<u64, ApiError> {
    let Some(requested) = request.order_numbers.filter(|list| !list.is_empty()) else {
        return Err(ApiError::validation(
            "Order numbers are required and must be a non-empty array",
        ));
    };

    let all = list_deliveries(ctx, &DeliveryFilter::default()).await?;
    let eligible = lifecycle::bulk_approve(&all, &requested);
    if eligible.is_empty() {
        return Err(ApiError::not_found(
            "No deliveries awaiting approval match these order numbers",
        ));
    }

    let approved = ctx
        .storage
        .approve_deliveries(&eligible, ApprovalScope::AwaitingApproval)
        .await
        .map_err(|err| storage_failure("Error approving deliveries", err))?;
    if approved == 0 {
        return Err(ApiError::not_found(
            "No deliveries awaiting approval match these order numbers",
        ));
    }
    info!(requested = requested.len(), approved, "deliveries approved");
    Ok(approved)
}

pub async fn pending_deliveries(ctx: &ApiContext) -> Result<Vec<Delivery>, ApiError> {
    let all = list_deliveries(ctx, &DeliveryFilter::default()).await?;
    Ok(lifecycle::pending_deliveries(&all).into_iter().cloned().collect())
}

pub async fn pending_approvals(ctx: &ApiContext) -> Result<Vec<Delivery>, ApiError> {
    let all = list_deliveries(ctx, &DeliveryFilter::default()).await?;
    Ok(lifecycle::pending_approvals(&all).into_iter().cloned().collect())
}

pub async fn delivery_history(ctx: &ApiContext) -> Result<Vec<Delivery>, ApiError> {
    let all = list_deliveries(ctx, &DeliveryFilter::default()).await?;
    Ok(lifecycle::history(&all).into_iter().cloned().collect())
}

/// Plans a round trip from the depot through every pending delivery.
pub async fn optimize_pending_route(
    ctx: &ApiContext,
) -> Result<OptimizedDeliveryRoute, ApiError> {
    let all = list_deliveries(ctx, &DeliveryFilter::default()).await?;
    let pending = lifecycle::pending_deliveries(&all);

    let origin = ctx
        .geocoder
        .geocode(&ctx.depot_address)
        .await
        .map_err(|err| upstream_failure("Error geocoding the depot address", err))?;
    if pending.is_empty() {
        return Ok(OptimizedDeliveryRoute {
            origin,
            stops: Vec::new(),
            total_distance_meters: 0,
            total_duration_seconds: 0,
        });
    }

    let waypoints: Vec<LatLng> = pending.iter().map(|record| record.location()).collect();
    let route = ctx
        .route_optimizer
        .optimize(origin, origin, &waypoints)
        .await
        .map_err(|err| upstream_failure("Error optimizing the delivery route", err))?;

    let order: Vec<usize> = if route.waypoint_order.len() == pending.len() {
        route.waypoint_order.clone()
    } else {
        (0..pending.len()).collect()
    };
    let visits = order
        .iter()
        .map(|&index| {
            pending.get(index).copied().ok_or_else(|| {
                ApiError::new(
                    ErrorCode::Upstream,
                    "Directions service returned an unknown waypoint",
                )
            })
        })
        .collect::<Result<Vec<&Delivery>, ApiError>>()?;

    let stops = route
        .legs
        .iter()
        .enumerate()
        .map(|(i, leg)| {
            let previous = i.checked_sub(1).and_then(|prev| visits.get(prev));
            let current = visits.get(i);
            RouteStop {
                order_number: current
                    .map(|record| record.order_number().to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
                customer_name: current
                    .map(|record| record.details.name.clone())
                    .unwrap_or_else(|| DEPOT_LABEL.to_string()),
                start: previous
                    .map(|record| street_address(record))
                    .unwrap_or_else(|| ctx.depot_address.clone()),
                end: current
                    .map(|record| street_address(record))
                    .unwrap_or_else(|| ctx.depot_address.clone()),
                distance: leg.distance_text.clone(),
                duration: leg.duration_text.clone(),
                delivery_status: current.map(|record| record.delivery_status),
            }
        })
        .collect();

    info!(
        stops = visits.len(),
        distance_meters = route.total_distance_meters(),
        "route optimized"
    );
    Ok(OptimizedDeliveryRoute {
        origin,
        stops,
        total_distance_meters: route.total_distance_meters(),
        total_duration_seconds: route.total_duration_seconds(),
    })
}

/// Decodes an uploaded manifest and, when asked, geocodes each location.
pub async fn parse_manifest(
    ctx: &ApiContext,
    upload: ManifestUpload,
) -> Result<ParsedManifest, ApiError> {
    let bytes = STANDARD
        .decode(upload.content.trim())
        .map_err(|_| ApiError::validation("manifest content must be base64"))?;
    if bytes.is_empty() {
        return Err(ApiError::validation("No file uploaded"));
    }

    let rows = ctx.manifest_parser.parse(&bytes).map_err(|err| {
        warn!(filename = %upload.filename, error = %err, "manifest rejected");
        ApiError::validation("Error processing file").with_cause(format!("{err:#}"))
    })?;

    let mut waypoints = Vec::new();
    if upload.geocode {
        for row in &rows {
            let point = ctx.geocoder.geocode(&row.location).await.map_err(|err| {
                upstream_failure(format!("Error geocoding '{}'", row.location), err)
            })?;
            waypoints.push(point);
        }
    }

    info!(filename = %upload.filename, rows = rows.len(), "manifest parsed");
    Ok(ParsedManifest { rows, waypoints })
}

pub async fn list_users(ctx: &ApiContext, session: Option<&Session>) -> Result<Vec<User>, ApiError> {
    require_owner(ctx, session).await?;
    ctx.storage
        .list_users()
        .await
        .map_err(|err| storage_failure("Error fetching users", err))
}

pub async fn update_user_role(
    ctx: &ApiContext,
    session: Option<&Session>,
    request: UpdateUserRoleRequest,
) -> Result<User, ApiError> {
    let owner = require_owner(ctx, session).await?;
    let role: Role = request
        .new_role
        .parse()
        .map_err(|err| ApiError::validation("Invalid role").with_cause(err))?;
    let user_id = UserId(request.user_id);

    let updated = ctx
        .storage
        .update_user_role(user_id, role)
        .await
        .map_err(|err| storage_failure("Error updating user role", err))?;
    if !updated {
        return Err(ApiError::not_found("User not found"));
    }
    let user = ctx
        .storage
        .get_user(user_id)
        .await
        .map_err(|err| storage_failure("Error updating user role", err))?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    info!(by = owner.id.0, user = user.id.0, role = %role, "user role changed");
    Ok(user)
}

pub fn session_info(session: Option<&Session>) -> SessionInfo {
    SessionInfo {
        role: session.map(|session| session.role),
        is_authenticated: session.is_some(),
    }
}

/// Checks the stored role rather than the one baked into the session.
async fn require_owner(ctx: &ApiContext, session: Option<&Session>) -> Result<User, ApiError> {
    let Some(session) = session else {
        return Err(ApiError::new(ErrorCode::Unauthorized, "Not signed in"));
    };
    let user = ctx
        .storage
        .get_user(session.user_id)
        .await
        .map_err(|err| storage_failure("Error checking session", err))?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "Session user no longer exists"))?;
    if user.role != Role::Owner {
        return Err(ApiError::new(ErrorCode::Forbidden, "Owner role required"));
    }
    Ok(user)
}

fn street_address(record: &Delivery) -> String {
    format!("{}, {}", record.details.address, record.details.city)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn valid_coordinate(value: f64, limit: f64) -> bool {
    value.is_finite() && value.abs() <= limit
}

fn storage_failure(message: &str, err: anyhow::Error) -> ApiError {
    let cause = format!("{err:#}");
    error!(error = %cause, "{message}");
    ApiError::new(ErrorCode::Storage, message).with_cause(cause)
}

fn upstream_failure(message: impl Into<String>, err: anyhow::Error) -> ApiError {
    let message = message.into();
    let cause = format!("{err:#}");
    error!(error = %cause, "{message}");
    ApiError::new(ErrorCode::Upstream, message).with_cause(cause)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
