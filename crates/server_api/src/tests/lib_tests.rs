use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use anyhow::bail;
use async_trait::async_trait;
use maps_integration::{SpreadsheetManifestParser, OptimizedRoute, RouteLeg};
use shared::domain::{Approval, DeliveryDetails};

const DEPOT: LatLng = LatLng {
    lat: 7.2008,
    lng: 79.8737,
};

struct FixedGeocoder {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn geocode(&self, address: &str) -> anyhow::Result<LatLng> {
        self.calls.lock().expect("lock").push(address.to_string());
        if address == "nowhere" {
            bail!("geocode request failed with status ZERO_RESULTS");
        }
        Ok(DEPOT)
    }
}

/// Visits waypoints in reverse and reports one leg per hop plus the return.
struct ReversingOptimizer {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl RouteOptimizer for ReversingOptimizer {
    async fn optimize(
        &self,
        _origin: LatLng,
        _destination: LatLng,
        waypoints: &[LatLng],
    ) -> anyhow::Result<OptimizedRoute> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("directions request failed with status OVER_QUERY_LIMIT");
        }
        let legs = (0..=waypoints.len())
            .map(|i| RouteLeg {
                start_address: format!("from {i}"),
                end_address: format!("to {i}"),
                distance_text: format!("{} km", i + 1),
                distance_meters: 1_000 * (i as u64 + 1),
                duration_text: format!("{} mins", i + 1),
                duration_seconds: 60 * (i as u64 + 1),
            })
            .collect();
        Ok(OptimizedRoute {
            waypoint_order: (0..waypoints.len()).rev().collect(),
            legs,
        })
    }
}

struct Fixture {
    ctx: ApiContext,
    geocoder: Arc<FixedGeocoder>,
    optimizer: Arc<ReversingOptimizer>,
}

async fn fixture_with(fail_routing: bool) -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let geocoder = Arc::new(FixedGeocoder {
        calls: Mutex::new(Vec::new()),
    });
    let optimizer = Arc::new(ReversingOptimizer {
        calls: AtomicUsize::new(0),
        fail: fail_routing,
    });
    let ctx = ApiContext {
        storage,
        geocoder: geocoder.clone(),
        route_optimizer: optimizer.clone(),
        manifest_parser: Arc::new(SpreadsheetManifestParser),
        depot_address: "357 Negombo - Colombo Main Rd, Negombo 11500".to_string(),
    };
    Fixture {
        ctx,
        geocoder,
        optimizer,
    }
}

async fn fixture() -> Fixture {
    fixture_with(false).await
}

fn upload(order_number: &str) -> UploadDeliveryRequest {
    UploadDeliveryRequest {
        details: DeliveryDetails {
            order_number: order_number.to_string(),
            name: format!("customer {order_number}"),
            address: "12 Lake Rd".to_string(),
            city: "Negombo".to_string(),
            contact_number: "0771234567".to_string(),
            latitude: 7.21,
            longitude: 79.84,
        },
        delivery_status: None,
        approval: None,
    }
}

fn status_update(order_number: &str, status: &str) -> UpdateDeliveryStatusRequest {
    UpdateDeliveryStatusRequest {
        order_number: Some(order_number.to_string()),
        delivery_status: Some(status.to_string()),
    }
}

fn approve(order_numbers: &[&str]) -> ApproveDeliveriesRequest {
    ApproveDeliveriesRequest {
        order_numbers: Some(order_numbers.iter().map(|o| o.to_string()).collect()),
    }
}

async fn seed(ctx: &ApiContext, order_numbers: &[&str]) {
    for order_number in order_numbers {
        upload_delivery(ctx, upload(order_number)).await.expect("upload");
    }
}

#[tokio::test]
async fn uploaded_delivery_starts_pending_and_unapproved() {
    let f = fixture().await;
    let id = upload_delivery(&f.ctx, upload("ORD-1")).await.expect("upload");

    let all = list_deliveries(&f.ctx, &DeliveryFilter::default())
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, id);
    assert_eq!(all[0].delivery_status, DeliveryStatus::Pending);
    assert_eq!(all[0].approval, Approval::No);
}

#[tokio::test]
async fn upload_rejects_coordinates_off_the_map() {
    let f = fixture().await;
    let mut request = upload("ORD-1");
    request.details.latitude = f64::NAN;
    let err = upload_delivery(&f.ctx, request).await.expect_err("nan");
    assert_eq!(err.code, ErrorCode::Validation);

    let mut request = upload("ORD-2");
    request.details.longitude = 200.0;
    let err = upload_delivery(&f.ctx, request).await.expect_err("out of range");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn status_update_requires_both_fields() {
    let f = fixture().await;
    seed(&f.ctx, &["ORD-1"]).await;

    let err = update_delivery_status(
        &f.ctx,
        UpdateDeliveryStatusRequest {
            order_number: Some("ORD-1".into()),
            delivery_status: None,
        },
    )
    .await
    .expect_err("missing status");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = update_delivery_status(&f.ctx, status_update("  ", "delivered"))
        .await
        .expect_err("blank order number");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn status_update_rejects_unknown_status_and_order() {
    let f = fixture().await;
    seed(&f.ctx, &["ORD-1"]).await;

    let err = update_delivery_status(&f.ctx, status_update("ORD-1", "shipped"))
        .await
        .expect_err("unknown status");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(err.error.as_deref(), Some("unknown delivery status 'shipped'"));

    let err = update_delivery_status(&f.ctx, status_update("ORD-404", "delivered"))
        .await
        .expect_err("unknown order");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn delivered_record_moves_to_pending_approval_then_history() {
    let f = fixture().await;
    seed(&f.ctx, &["ORD-1", "ORD-2"]).await;

    let result = update_delivery_status(&f.ctx, status_update("ORD-1", "delivered"))
        .await
        .expect("update");
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);

    let pending = pending_deliveries(&f.ctx).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].order_number(), "ORD-2");
    let awaiting = pending_approvals(&f.ctx).await.expect("awaiting");
    assert_eq!(awaiting.len(), 1);
    assert_eq!(awaiting[0].order_number(), "ORD-1");

    let approved = approve_deliveries(&f.ctx, approve(&["ORD-1"]))
        .await
        .expect("approve");
    assert_eq!(approved, 1);

    let done = delivery_history(&f.ctx).await.expect("history");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].order_number(), "ORD-1");
    assert!(pending_approvals(&f.ctx).await.expect("awaiting").is_empty());
}

#[tokio::test]
async fn approve_requires_a_non_empty_list() {
    let f = fixture().await;
    let err = approve_deliveries(&f.ctx, ApproveDeliveriesRequest::default())
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = approve_deliveries(&f.ctx, approve(&[]))
        .await
        .expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn approve_only_touches_delivered_records() {
    let f = fixture().await;
    seed(&f.ctx, &["A", "B", "C"]).await;
    update_delivery_status(&f.ctx, status_update("A", "delivered"))
        .await
        .expect("update");

    let approved = approve_deliveries(&f.ctx, approve(&["A", "B", "Z"]))
        .await
        .expect("approve");
    assert_eq!(approved, 1);

    let b = list_deliveries(
        &f.ctx,
        &DeliveryFilter {
            order_number: Some("B".into()),
            ..DeliveryFilter::default()
        },
    )
    .await
    .expect("list");
    assert_eq!(b[0].approval, Approval::No);
}

#[tokio::test]
async fn approve_without_eligible_records_is_not_found() {
    let f = fixture().await;
    seed(&f.ctx, &["A"]).await;
    let err = approve_deliveries(&f.ctx, approve(&["A", "Z"]))
        .await
        .expect_err("nothing eligible");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn route_visits_pending_deliveries_in_optimized_order() {
    let f = fixture().await;
    seed(&f.ctx, &["ORD-1", "ORD-2", "ORD-3"]).await;
    update_delivery_status(&f.ctx, status_update("ORD-3", "delivered"))
        .await
        .expect("update");

    let route = optimize_pending_route(&f.ctx).await.expect("route");
    assert_eq!(route.origin, DEPOT);
    assert_eq!(route.stops.len(), 3);

    // Pending snapshot is newest first: [ORD-2, ORD-1]; the optimizer reverses it.
    let order: Vec<&str> = route.stops.iter().map(|s| s.order_number.as_str()).collect();
    assert_eq!(order, vec!["ORD-1", "ORD-2", "N/A"]);
    assert_eq!(route.stops[0].start, f.ctx.depot_address);
    assert_eq!(route.stops[1].start, "12 Lake Rd, Negombo");
    assert_eq!(route.stops[2].customer_name, "Warehouse");
    assert_eq!(route.stops[2].end, f.ctx.depot_address);
    assert_eq!(route.stops[2].delivery_status, None);
    assert_eq!(route.stops[0].delivery_status, Some(DeliveryStatus::Pending));
    assert_eq!(route.total_distance_meters, 6_000);
    assert_eq!(route.total_duration_seconds, 360);
}

#[tokio::test]
async fn route_without_pending_deliveries_skips_the_optimizer() {
    let f = fixture().await;
    let route = optimize_pending_route(&f.ctx).await.expect("route");
    assert!(route.stops.is_empty());
    assert_eq!(f.optimizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn route_optimizer_failure_is_an_upstream_error() {
    let f = fixture_with(true).await;
    seed(&f.ctx, &["ORD-1"]).await;
    let err = optimize_pending_route(&f.ctx).await.expect_err("upstream");
    assert_eq!(err.code, ErrorCode::Upstream);
    assert!(err
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("OVER_QUERY_LIMIT"));
}

#[tokio::test]
async fn manifest_rows_are_parsed_and_geocoded_on_request() {
    let f = fixture().await;
    let content = STANDARD.encode("Date,Location\n2024-05-01,Negombo\n2024-05-02,Ja-Ela\n");

    let parsed = parse_manifest(
        &f.ctx,
        ManifestUpload {
            filename: "may.csv".into(),
            content: content.clone(),
            geocode: false,
        },
    )
    .await
    .expect("parse");
    assert_eq!(parsed.rows.len(), 2);
    assert!(parsed.waypoints.is_empty());
    assert!(f.geocoder.calls.lock().expect("lock").is_empty());

    let parsed = parse_manifest(
        &f.ctx,
        ManifestUpload {
            filename: "may.csv".into(),
            content,
            geocode: true,
        },
    )
    .await
    .expect("parse");
    assert_eq!(parsed.waypoints, vec![DEPOT, DEPOT]);
    assert_eq!(
        *f.geocoder.calls.lock().expect("lock"),
        vec!["Negombo".to_string(), "Ja-Ela".to_string()]
    );
}

#[tokio::test]
async fn manifest_rejects_bad_encoding_and_bad_rows() {
    let f = fixture().await;
    let err = parse_manifest(
        &f.ctx,
        ManifestUpload {
            filename: "x.csv".into(),
            content: "not base64!".into(),
            geocode: false,
        },
    )
    .await
    .expect_err("bad base64");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = parse_manifest(
        &f.ctx,
        ManifestUpload {
            filename: "x.csv".into(),
            content: STANDARD.encode("Date,Location\n2024-05-01\n"),
            geocode: false,
        },
    )
    .await
    .expect_err("missing location");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(err.message, "Error processing file");
}

#[tokio::test]
async fn user_admin_requires_an_owner_session() {
    let f = fixture().await;
    let driver = f
        .ctx
        .storage
        .create_user("Dinesh", "dinesh@example.com", Role::Driver)
        .await
        .expect("driver");

    let err = list_users(&f.ctx, None).await.expect_err("anonymous");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let session = Session {
        user_id: driver,
        role: Role::Driver,
    };
    let err = list_users(&f.ctx, Some(&session)).await.expect_err("driver");
    assert_eq!(err.code, ErrorCode::Forbidden);

    // A stale token claiming owner is still checked against the stored role.
    let stale = Session {
        user_id: driver,
        role: Role::Owner,
    };
    let err = list_users(&f.ctx, Some(&stale)).await.expect_err("stale");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn owner_can_change_roles() {
    let f = fixture().await;
    let owner = f
        .ctx
        .storage
        .create_user("Olivia", "olivia@example.com", Role::Owner)
        .await
        .expect("owner");
    let newcomer = f
        .ctx
        .storage
        .create_user("Nimal", "nimal@example.com", Role::Pending)
        .await
        .expect("newcomer");
    let session = Session {
        user_id: owner,
        role: Role::Owner,
    };

    let user = update_user_role(
        &f.ctx,
        Some(&session),
        UpdateUserRoleRequest {
            user_id: newcomer.0,
            new_role: "driver".into(),
        },
    )
    .await
    .expect("update");
    assert_eq!(user.role, Role::Driver);
    assert_eq!(list_users(&f.ctx, Some(&session)).await.expect("users").len(), 2);

    let err = update_user_role(
        &f.ctx,
        Some(&session),
        UpdateUserRoleRequest {
            user_id: newcomer.0,
            new_role: "captain".into(),
        },
    )
    .await
    .expect_err("bad role");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = update_user_role(
        &f.ctx,
        Some(&session),
        UpdateUserRoleRequest {
            user_id: 9_999,
            new_role: "admin".into(),
        },
    )
    .await
    .expect_err("missing user");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[test]
fn session_info_reflects_presence_of_a_session() {
    assert_eq!(
        session_info(None),
        SessionInfo {
            role: None,
            is_authenticated: false,
        }
    );
    let session = Session {
        user_id: UserId(1),
        role: Role::Admin,
    };
    assert_eq!(
        session_info(Some(&session)),
        SessionInfo {
            role: Some(Role::Admin),
            is_authenticated: true,
        }
    );
}
