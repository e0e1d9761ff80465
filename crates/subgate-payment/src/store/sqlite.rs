//! SQLite store
//!
//! Statements run on the blocking pool behind one connection mutex. The
//! replay guard relies on the `used_signatures` primary key and the ledger on
//! `ON CONFLICT(user_id)`, so both stay atomic even across processes sharing
//! the database file.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{PaymentIntent, Plan, Profile, Subscription, SubscriptionStatus};
use crate::store::{IntentStore, ProfileStore, SignatureRegistry, SubscriptionStore};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS profiles (
    id                 TEXT PRIMARY KEY,
    wallet_address     TEXT UNIQUE,
    email              TEXT,
    stripe_customer_id TEXT,
    created_at         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_intents (
    id                    TEXT PRIMARY KEY,
    user_id               TEXT NOT NULL,
    plan                  TEXT NOT NULL,
    amount                INTEGER NOT NULL,
    currency              TEXT NOT NULL,
    memo                  TEXT NOT NULL,
    status                TEXT NOT NULL DEFAULT 'pending',
    created_at            INTEGER NOT NULL,
    expires_at            INTEGER NOT NULL,
    transaction_signature TEXT,
    completed_at          INTEGER
);

CREATE TABLE IF NOT EXISTS used_signatures (
    signature  TEXT PRIMARY KEY,
    context    TEXT NOT NULL,
    claimed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    user_id                TEXT PRIMARY KEY,
    plan                   TEXT NOT NULL,
    status                 TEXT NOT NULL,
    current_period_end     INTEGER NOT NULL,
    payment_method         TEXT NOT NULL,
    last_payment_signature TEXT,
    stripe_subscription_id TEXT,
    stripe_customer_id     TEXT
);

CREATE INDEX IF NOT EXISTS idx_intents_pending ON payment_intents(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_profiles_email ON profiles(email);
CREATE INDEX IF NOT EXISTS idx_profiles_customer ON profiles(stripe_customer_id);
"#;

const INTENT_COLUMNS: &str = "id, user_id, plan, amount, currency, memo, status, created_at, \
                              expires_at, transaction_signature, completed_at";

const SUBSCRIPTION_COLUMNS: &str = "user_id, plan, status, current_period_end, payment_method, \
                                    last_payment_signature, stripe_subscription_id, stripe_customer_id";

const PROFILE_COLUMNS: &str = "id, wallet_address, email, stripe_customer_id, created_at";

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> PaymentResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, &path.display().to_string())
    }

    /// Private in-memory database
    pub fn open_in_memory() -> PaymentResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> PaymentResult<Self> {
        conn.execute_batch(SCHEMA)?;
        info!("SQLite store ready at {}", label);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> PaymentResult<T>
    where
        F: FnOnce(&Connection) -> PaymentResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PaymentError::Storage("connection mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| PaymentError::Storage(format!("spawn_blocking: {}", e)))?
    }
}

// =====================
// Row mapping
// =====================

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = PaymentError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, PaymentError::Storage(format!("bad timestamp {}", ms))))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    match ms {
        Some(_) => time_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentIntent> {
    Ok(PaymentIntent {
        id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        plan: text_col(row, 2)?,
        amount: row.get::<_, i64>(3)? as u64,
        currency: text_col(row, 4)?,
        memo: row.get(5)?,
        status: text_col(row, 6)?,
        created_at: time_col(row, 7)?,
        expires_at: time_col(row, 8)?,
        transaction_signature: row.get(9)?,
        completed_at: opt_time_col(row, 10)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        user_id: uuid_col(row, 0)?,
        plan: text_col(row, 1)?,
        status: text_col(row, 2)?,
        current_period_end: time_col(row, 3)?,
        payment_method: text_col(row, 4)?,
        last_payment_signature: row.get(5)?,
        stripe_subscription_id: row.get(6)?,
        stripe_customer_id: row.get(7)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: uuid_col(row, 0)?,
        wallet_address: row.get(1)?,
        email: row.get(2)?,
        stripe_customer_id: row.get(3)?,
        created_at: time_col(row, 4)?,
    })
}

fn profile_where(conn: &Connection, clause: &str, value: &str) -> PaymentResult<Option<Profile>> {
    let sql = format!(
        "SELECT {} FROM profiles WHERE {} = ?1 ORDER BY created_at LIMIT 1",
        PROFILE_COLUMNS, clause
    );
    Ok(conn.query_row(&sql, params![value], profile_from_row).optional()?)
}

fn subscription_for(conn: &Connection, user_id: &str) -> PaymentResult<Option<Subscription>> {
    let sql = format!("SELECT {} FROM subscriptions WHERE user_id = ?1", SUBSCRIPTION_COLUMNS);
    Ok(conn.query_row(&sql, params![user_id], subscription_from_row).optional()?)
}

// =====================
// Store traits
// =====================

#[async_trait]
impl IntentStore for SqliteStore {
    async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()> {
        let intent = intent.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO payment_intents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    INTENT_COLUMNS
                ),
                params![
                    intent.id.to_string(),
                    intent.user_id.to_string(),
                    intent.plan.as_str(),
                    intent.amount as i64,
                    intent.currency.as_str(),
                    intent.memo,
                    intent.status.as_str(),
                    intent.created_at.timestamp_millis(),
                    intent.expires_at.timestamp_millis(),
                    intent.transaction_signature,
                    intent.completed_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_intent(&self, id: Uuid) -> PaymentResult<Option<PaymentIntent>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM payment_intents WHERE id = ?1", INTENT_COLUMNS);
            Ok(conn
                .query_row(&sql, params![id.to_string()], intent_from_row)
                .optional()?)
        })
        .await
    }

    async fn complete_intent(
        &self,
        id: Uuid,
        signature: &str,
        completed_at: DateTime<Utc>,
    ) -> PaymentResult<bool> {
        let signature = signature.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE payment_intents
                 SET status = 'completed', transaction_signature = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), signature, completed_at.timestamp_millis()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn expire_intent(&self, id: Uuid) -> PaymentResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE payment_intents SET status = 'expired' WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> PaymentResult<usize> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE payment_intents SET status = 'expired'
                 WHERE status = 'pending' AND expires_at < ?1",
                params![now.timestamp_millis()],
            )?;
            Ok(changed)
        })
        .await
    }
}

#[async_trait]
impl SignatureRegistry for SqliteStore {
    async fn claim_signature(
        &self,
        signature: &str,
        context: &str,
        claimed_at: DateTime<Utc>,
    ) -> PaymentResult<bool> {
        let signature = signature.to_string();
        let context = context.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO used_signatures (signature, context, claimed_at)
                 VALUES (?1, ?2, ?3)",
                params![signature, context, claimed_at.timestamp_millis()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn is_claimed(&self, signature: &str) -> PaymentResult<bool> {
        let signature = signature.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM used_signatures WHERE signature = ?1",
                    params![signature],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn release_signature(&self, signature: &str) -> PaymentResult<()> {
        let signature = signature.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM used_signatures WHERE signature = ?1",
                params![signature],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn upsert_active(&self, record: &Subscription) -> PaymentResult<Subscription> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO subscriptions ({cols})
                 VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id) DO UPDATE SET
                   plan = excluded.plan,
                   status = 'active',
                   current_period_end = MAX(subscriptions.current_period_end, excluded.current_period_end),
                   payment_method = excluded.payment_method,
                   last_payment_signature = COALESCE(excluded.last_payment_signature, subscriptions.last_payment_signature),
                   stripe_subscription_id = COALESCE(excluded.stripe_subscription_id, subscriptions.stripe_subscription_id),
                   stripe_customer_id = COALESCE(excluded.stripe_customer_id, subscriptions.stripe_customer_id)
                 RETURNING {cols}",
                cols = SUBSCRIPTION_COLUMNS
            );
            Ok(conn.query_row(
                &sql,
                params![
                    record.user_id.to_string(),
                    record.plan.as_str(),
                    record.current_period_end.timestamp_millis(),
                    record.payment_method.as_str(),
                    record.last_payment_signature,
                    record.stripe_subscription_id,
                    record.stripe_customer_id,
                ],
                subscription_from_row,
            )?)
        })
        .await
    }

    async fn downgrade(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE subscriptions SET status = 'canceled', plan = 'free'
                 WHERE user_id = ?1 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![user_id.to_string()], subscription_from_row)
                .optional()?)
        })
        .await
    }

    async fn apply_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
        plan: Option<Plan>,
        period_end: Option<DateTime<Utc>>,
    ) -> PaymentResult<Option<Subscription>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE subscriptions SET
                   status = ?2,
                   plan = COALESCE(?4, plan),
                   current_period_end = MAX(current_period_end, COALESCE(?3, current_period_end))
                 WHERE user_id = ?1 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![
                        user_id.to_string(),
                        status.as_str(),
                        period_end.map(|t| t.timestamp_millis()),
                        plan.map(|p| p.as_str()),
                    ],
                    subscription_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn get_subscription(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
        self.with_conn(move |conn| subscription_for(conn, &user_id.to_string()))
            .await
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get_profile(&self, id: Uuid) -> PaymentResult<Option<Profile>> {
        self.with_conn(move |conn| profile_where(conn, "id", &id.to_string()))
            .await
    }

    async fn insert_profile(&self, profile: &Profile) -> PaymentResult<()> {
        let profile = profile.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO profiles ({}) VALUES (?1, ?2, ?3, ?4, ?5)", PROFILE_COLUMNS),
                params![
                    profile.id.to_string(),
                    profile.wallet_address,
                    profile.email,
                    profile.stripe_customer_id,
                    profile.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_by_wallet(&self, wallet: &str) -> PaymentResult<Option<Profile>> {
        let wallet = wallet.to_string();
        self.with_conn(move |conn| profile_where(conn, "wallet_address", &wallet))
            .await
    }

    async fn find_by_email(&self, email: &str) -> PaymentResult<Option<Profile>> {
        let email = email.to_string();
        self.with_conn(move |conn| profile_where(conn, "email", &email))
            .await
    }

    async fn find_by_customer(&self, customer_id: &str) -> PaymentResult<Option<Profile>> {
        let customer_id = customer_id.to_string();
        self.with_conn(move |conn| profile_where(conn, "stripe_customer_id", &customer_id))
            .await
    }

    async fn get_or_create_wallet_profile(&self, wallet: &str) -> PaymentResult<Profile> {
        let wallet = wallet.to_string();
        self.with_conn(move |conn| {
            let fresh = Profile::for_wallet(&wallet);
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO profiles ({}) VALUES (?1, ?2, NULL, NULL, ?3)",
                    PROFILE_COLUMNS
                ),
                params![fresh.id.to_string(), wallet, fresh.created_at.timestamp_millis()],
            )?;
            profile_where(conn, "wallet_address", &wallet)?
                .ok_or_else(|| PaymentError::Storage(format!("profile for {} vanished", wallet)))
        })
        .await
    }

    async fn get_or_create_email_profile(&self, email: &str) -> PaymentResult<Profile> {
        let email = email.to_string();
        self.with_conn(move |conn| {
            let fresh = Profile::for_email(&email);
            conn.execute(
                &format!(
                    "INSERT INTO profiles ({})
                     SELECT ?1, NULL, ?2, NULL, ?3
                     WHERE NOT EXISTS (SELECT 1 FROM profiles WHERE email = ?2)",
                    PROFILE_COLUMNS
                ),
                params![fresh.id.to_string(), email, fresh.created_at.timestamp_millis()],
            )?;
            profile_where(conn, "email", &email)?
                .ok_or_else(|| PaymentError::Storage(format!("profile for {} vanished", email)))
        })
        .await
    }

    async fn link_customer(
        &self,
        id: Uuid,
        customer_id: &str,
        email: Option<&str>,
    ) -> PaymentResult<()> {
        let customer_id = customer_id.to_string();
        let email = email.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE profiles SET stripe_customer_id = ?2, email = COALESCE(email, ?3)
                 WHERE id = ?1",
                params![id.to_string(), customer_id, email],
            )?;
            Ok(())
        })
        .await
    }
}
