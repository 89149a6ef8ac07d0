use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::entities::{card, card_log};
use crate::error::{RedeemError, RejectReason};

/// Truncated SHA-256 of a card key, safe for log lines and audit rows.
/// The raw key never leaves the cards table.
pub fn key_digest(card_key: &str) -> String {
    let digest = Sha256::digest(card_key.as_bytes());
    hex::encode(&digest[..6])
}

/// Who presented the card, for the audit trail.
#[derive(Debug, Clone, Default)]
pub struct Requester {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// A successful redemption: one use charged, constraints resolved.
#[derive(Debug, Clone)]
pub struct Redeemed {
    pub card_id: Uuid,
    pub mail_account_id: Option<Uuid>,
    pub lookback_days: u32,
    pub sender_allowlist: Vec<String>,
    pub remaining_uses: i32,
}

/// The card state machine. All transitions happen in SQL so that
/// concurrent redeemers on different processes still serialize.
#[derive(Clone)]
pub struct CardLedger {
    db: DatabaseConnection,
}

impl CardLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Validate the card and charge exactly one use.
    ///
    /// The charge is a compare-and-increment: the UPDATE only lands if
    /// `used_count` still equals the value just read and the card is
    /// still active. A lost race re-reads and retries; every lost race
    /// means some other redemption succeeded, and after `usage_limit`
    /// successes the re-read observes the card exhausted, so the loop
    /// always terminates.
    pub async fn redeem(
        &self,
        card_key: &str,
        requester: &Requester,
    ) -> Result<Redeemed, RedeemError> {
        let digest = key_digest(card_key);
        loop {
            let Some(model) = card::Entity::find()
                .filter(card::Column::CardKey.eq(card_key))
                .one(&self.db)
                .await?
            else {
                self.log(None, &digest, "reject", RejectReason::NotFound.code(), requester)
                    .await?;
                return Err(RedeemError::Rejected(RejectReason::NotFound));
            };

            if let Some(reason) = self.check(&model).await? {
                self.log(Some(model.id), &digest, "reject", reason.code(), requester)
                    .await?;
                return Err(RedeemError::Rejected(reason));
            }

            let next = model.used_count + 1;
            let mut update = card::Entity::update_many()
                .col_expr(card::Column::UsedCount, Expr::value(next))
                .col_expr(card::Column::UpdatedAt, Expr::value(Utc::now()));
            if next >= model.usage_limit {
                // Last use and the exhausted transition land in the same
                // atomic statement.
                update = update.col_expr(card::Column::Status, Expr::value("exhausted"));
            }
            let result = update
                .filter(card::Column::Id.eq(model.id))
                .filter(card::Column::UsedCount.eq(model.used_count))
                .filter(card::Column::Status.eq("active"))
                .exec(&self.db)
                .await?;

            if result.rows_affected == 0 {
                tracing::debug!(card = %model.id, "redemption raced, retrying");
                continue;
            }

            self.log(
                Some(model.id),
                &digest,
                "redeem",
                &format!("use {next}/{}", model.usage_limit),
                requester,
            )
            .await?;

            return Ok(Redeemed {
                card_id: model.id,
                mail_account_id: model.mail_account_id,
                lookback_days: u32::try_from(model.lookback_days).unwrap_or(1),
                sender_allowlist: parse_allowlist(&model.sender_allowlist),
                remaining_uses: model.usage_limit - next,
            });
        }
    }

    /// Pre-charge validation, in precedence order: disabled, expired,
    /// exhausted. Lazily persists transitions the stored row has not
    /// caught up with.
    async fn check(&self, model: &card::Model) -> Result<Option<RejectReason>, RedeemError> {
        match model.status.as_str() {
            "active" => {}
            "expired" => return Ok(Some(RejectReason::Expired)),
            "exhausted" => return Ok(Some(RejectReason::Exhausted)),
            // "disabled" and anything unrecognized: never redeemable.
            _ => return Ok(Some(RejectReason::Disabled)),
        }

        if let Some(expires_at) = model.expires_at {
            if expires_at <= Utc::now() {
                self.transition(model.id, "expired").await?;
                return Ok(Some(RejectReason::Expired));
            }
        }
        if model.used_count >= model.usage_limit {
            self.transition(model.id, "exhausted").await?;
            return Ok(Some(RejectReason::Exhausted));
        }
        Ok(None)
    }

    /// Move an active card into a terminal status. Guarded on
    /// status='active' so a concurrent transition is a no-op.
    async fn transition(&self, card_id: Uuid, status: &str) -> Result<(), RedeemError> {
        card::Entity::update_many()
            .col_expr(card::Column::Status, Expr::value(status))
            .col_expr(card::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(card::Column::Id.eq(card_id))
            .filter(card::Column::Status.eq("active"))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn log(
        &self,
        card_id: Option<Uuid>,
        digest: &str,
        action: &str,
        outcome: &str,
        requester: &Requester,
    ) -> Result<(), RedeemError> {
        card_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            card_id: Set(card_id),
            card_key_digest: Set(digest.to_string()),
            action: Set(action.to_string()),
            outcome: Set(outcome.to_string()),
            client_ip: Set(requester.ip.clone()),
            user_agent: Set(requester.user_agent.clone()),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }
}

fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
