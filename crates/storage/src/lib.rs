use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};
use uuid::Uuid;

use shared::{
    domain::{
        Approval, Delivery, DeliveryDetails, DeliveryId, DeliveryStatus, NewDelivery, Role, User,
        UserId,
    },
    protocol::{DeliveryFilter, UpdateResult},
};

const DELIVERY_COLUMNS: &str = "id, order_number, name, address, city, contact_number, \
     latitude, longitude, delivery_status, approval, uploaded_at, updated_at";

/// Which of the matched deliveries an approval may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalScope {
    /// Every delivery with a listed order number.
    Any,
    /// Only delivered deliveries that are not yet approved.
    AwaitingApproval,
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(%database_url, "delivery store ready");
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts a delivery, defaulting status to `pending` and approval to `no`.
    pub async fn create_delivery(&self, delivery: &NewDelivery) -> Result<DeliveryId> {
        let id = DeliveryId::generate();
        let details = &delivery.details;
        sqlx::query(
            "INSERT INTO deliveries (id, order_number, name, address, city, contact_number, latitude, longitude, delivery_status, approval, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.0.to_string())
        .bind(&details.order_number)
        .bind(&details.name)
        .bind(&details.address)
        .bind(&details.city)
        .bind(&details.contact_number)
        .bind(details.latitude)
        .bind(details.longitude)
        .bind(delivery.delivery_status.unwrap_or_default().as_str())
        .bind(delivery.approval.unwrap_or_default().as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert delivery")?;
        debug!(%id, order_number = %details.order_number, "delivery inserted");
        Ok(id)
    }

    /// Lists deliveries matching `filter`, newest upload first.
    pub async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE 1 = 1"
        ));
        if let Some(order_number) = filter.order_number.as_deref() {
            query.push(" AND order_number = ").push_bind(order_number);
        }
        if let Some(status) = filter.delivery_status {
            query.push(" AND delivery_status = ").push_bind(status.as_str());
        }
        if let Some(approval) = filter.approval {
            query.push(" AND approval = ").push_bind(approval.as_str());
        }
        if let Some(city) = filter.city.as_deref() {
            query.push(" AND city = ").push_bind(city);
        }
        query.push(" ORDER BY uploaded_at DESC, rowid DESC");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list deliveries")?;
        rows.iter().map(decode_delivery).collect()
    }

    /// Sets the status of the earliest delivery carrying `order_number`.
    /// Returns `None` when no delivery matches.
    pub async fn update_delivery_status(
        &self,
        order_number: &str,
        status: DeliveryStatus,
    ) -> Result<Option<UpdateResult>> {
        let current = sqlx::query(
            "SELECT id, delivery_status FROM deliveries
             WHERE order_number = ?
             ORDER BY uploaded_at ASC, rowid ASC
             LIMIT 1",
        )
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up delivery")?;
        let Some(current) = current else {
            return Ok(None);
        };
        let id: String = current.try_get("id")?;
        let previous: String = current.try_get("delivery_status")?;

        let result = sqlx::query("UPDATE deliveries SET delivery_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(&id)
            .execute(&self.pool)
            .await
            .context("failed to update delivery status")?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(UpdateResult {
            matched_count: 1,
            modified_count: u64::from(previous != status.as_str()),
        }))
    }

    /// Marks deliveries whose order number is in `order_numbers` as approved
    /// in a single statement. Returns the number of matched deliveries.
    pub async fn approve_deliveries(
        &self,
        order_numbers: &[String],
        scope: ApprovalScope,
    ) -> Result<u64> {
        if order_numbers.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE deliveries SET approval = ");
        query
            .push_bind(Approval::Approved.as_str())
            .push(", updated_at = ")
            .push_bind(Utc::now())
            .push(" WHERE order_number IN (");
        let mut order_list = query.separated(", ");
        for order_number in order_numbers {
            order_list.push_bind(order_number.as_str());
        }
        order_list.push_unseparated(")");
        if scope == ApprovalScope::AwaitingApproval {
            query
                .push(" AND delivery_status = ")
                .push_bind(DeliveryStatus::Delivered.as_str())
                .push(" AND approval <> ")
                .push_bind(Approval::Approved.as_str());
        }

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .context("failed to approve deliveries")?;
        Ok(result.rows_affected())
    }

    pub async fn create_user(&self, name: &str, email: &str, role: Role) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (name, email, role) VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET name=excluded.name
             RETURNING id",
        )
        .bind(name)
        .bind(email)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, name, email, role FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_user).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT id, name, email, role FROM users ORDER BY lower(name) ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_user).collect()
    }

    /// Returns `false` when the user does not exist.
    pub async fn update_user_role(&self, user_id: UserId, role: Role) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn decode_delivery(row: &SqliteRow) -> Result<Delivery> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id).with_context(|| format!("malformed delivery id '{id}'"))?;
    let delivery_status = row.try_get::<String, _>("delivery_status")?.parse()?;
    let approval = row.try_get::<String, _>("approval")?.parse()?;

    Ok(Delivery {
        id: DeliveryId(id),
        details: DeliveryDetails {
            order_number: row.try_get("order_number")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            contact_number: row.try_get("contact_number")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
        },
        delivery_status,
        approval,
        uploaded_at: row.try_get::<DateTime<Utc>, _>("uploaded_at")?,
        updated_at: row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?,
    })
}

fn decode_user(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: UserId(row.try_get("id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        role: row.try_get::<String, _>("role")?.parse()?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
