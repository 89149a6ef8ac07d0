use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A redeemable access token. `used_count` never exceeds `usage_limit`,
/// enforced by the compare-and-increment in the ledger. `status` moves
/// active -> {exhausted | expired | disabled}; only disabled is reversible.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cards")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub card_key: String,
    pub usage_limit: i32,
    pub used_count: i32,
    /// "active", "disabled", "exhausted" or "expired"
    pub status: String,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub mail_account_id: Option<Uuid>,
    /// Trailing days of mail a redemption may see.
    pub lookback_days: i32,
    /// Comma-separated sender addresses; empty = unrestricted.
    #[sea_orm(column_type = "Text")]
    pub sender_allowlist: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::mail_account::Entity",
        from = "Column::MailAccountId",
        to = "super::mail_account::Column::Id"
    )]
    MailAccount,
    #[sea_orm(has_many = "super::card_log::Entity")]
    Logs,
}

impl Related<super::mail_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MailAccount.def()
    }
}

impl Related<super::card_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Logs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
