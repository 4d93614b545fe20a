//! Background task turning due reminders into notifications.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use tracing::{error, info};

use crate::{api::notifications::notify, model::notification::NotificationKind};

/// Upper bound of reminders handled per tick.
const BATCH: i64 = 500;

#[derive(Debug, sqlx::FromRow)]
struct DueReminder {
    id: u64,
    user_id: u64,
    title: String,
    body: Option<String>,
    lead_id: Option<u64>,
}

fn link_for(lead_id: Option<u64>) -> String {
    match lead_id {
        Some(id) => format!("/leads/{id}"),
        None => "/reminders".to_string(),
    }
}

/// Notify every due, open, not yet notified reminder once.
///
/// Rows are locked for the duration of the transaction, so two dispatchers
/// racing on the same database never notify twice.
pub async fn dispatch_due(pool: &MySqlPool, now: DateTime<Utc>) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let due = sqlx::query_as::<_, DueReminder>(
        r#"
        SELECT id, user_id, title, body, lead_id
        FROM reminders
        WHERE done = FALSE AND notified_at IS NULL AND due_at <= ?
        ORDER BY due_at
        LIMIT ?
        FOR UPDATE
        "#,
    )
    .bind(now)
    .bind(BATCH)
    .fetch_all(&mut *tx)
    .await?;

    for reminder in &due {
        notify(
            &mut *tx,
            reminder.user_id,
            NotificationKind::Reminder,
            &reminder.title,
            reminder.body.as_deref(),
            Some(&link_for(reminder.lead_id)),
        )
        .await?;

        sqlx::query("UPDATE reminders SET notified_at = ? WHERE id = ?")
            .bind(now)
            .bind(reminder.id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(due.len())
}

/// Poll forever on the actix runtime.
pub fn spawn_dispatcher(pool: MySqlPool, every_secs: u64) {
    actix_web::rt::spawn(async move {
        let mut ticker = actix_web::rt::time::interval(Duration::from_secs(every_secs.max(1)));
        loop {
            ticker.tick().await;
            match dispatch_due(&pool, Utc::now()).await {
                Ok(0) => {}
                Ok(sent) => info!(sent, "Reminder notifications sent"),
                Err(e) => error!(error = %e, "Reminder dispatch failed"),
            }
        }
    });
}
