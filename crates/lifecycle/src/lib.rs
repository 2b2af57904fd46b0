//! Delivery lifecycle rules.
//!
//! Everything here is a pure function over a snapshot of delivery records.
//! The controller never rejects a stored status/approval combination; it only
//! decides which dashboard view a record belongs to and which records a bulk
//! approval may touch.

use std::collections::HashSet;

use shared::domain::{Approval, Delivery, DeliveryStatus};

/// Dashboard views a delivery can appear in. Every record is in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    PendingDeliveries,
    PendingApproval,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
    pub view_before: View,
    pub view_after: View,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }

    pub fn leaves(&self, view: View) -> bool {
        self.view_before == view && self.view_after != view
    }

    pub fn enters(&self, view: View) -> bool {
        self.view_before != view && self.view_after == view
    }
}

pub fn classify_parts(status: DeliveryStatus, approval: Approval) -> View {
    match (status, approval) {
        (DeliveryStatus::Pending, _) => View::PendingDeliveries,
        (DeliveryStatus::Delivered, Approval::Approved) => View::History,
        (DeliveryStatus::Delivered, Approval::No) => View::PendingApproval,
    }
}

pub fn classify(record: &Delivery) -> View {
    classify_parts(record.delivery_status, record.approval)
}

pub fn in_view<'a>(all: &'a [Delivery], view: View) -> Vec<&'a Delivery> {
    all.iter()
        .filter(|record| classify(record) == view)
        .collect()
}

pub fn pending_deliveries(all: &[Delivery]) -> Vec<&Delivery> {
    in_view(all, View::PendingDeliveries)
}

pub fn pending_approvals(all: &[Delivery]) -> Vec<&Delivery> {
    in_view(all, View::PendingApproval)
}

pub fn history(all: &[Delivery]) -> Vec<&Delivery> {
    in_view(all, View::History)
}

/// Describes moving `record` to `new_status`. Every pair of statuses is a
/// valid transition, including a move back to pending.
pub fn transition(record: &Delivery, new_status: DeliveryStatus) -> Transition {
    Transition {
        from: record.delivery_status,
        to: new_status,
        view_before: classify(record),
        view_after: classify_parts(new_status, record.approval),
    }
}

/// Order numbers from `requested` that are currently awaiting approval, in
/// snapshot order and without duplicates. Anything else is ignored.
pub fn bulk_approve<S: AsRef<str>>(all: &[Delivery], requested: &[S]) -> Vec<String> {
    let requested: HashSet<&str> = requested.iter().map(AsRef::as_ref).collect();
    let mut seen = HashSet::new();
    pending_approvals(all)
        .into_iter()
        .map(Delivery::order_number)
        .filter(|order_number| requested.contains(order_number))
        .filter(|order_number| seen.insert(*order_number))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
