use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A third-party mailbox an administrator has configured.
/// Never deleted while a card references it.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "mail_accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub email: String,
    pub username: String,
    #[sea_orm(column_type = "Text")]
    pub password: String,
    pub server: String,
    pub port: i32,
    /// "imap" or "pop3"
    pub protocol: String,
    pub use_ssl: bool,
    pub enabled: bool,
    pub last_tested_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_test_ok: Option<bool>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::card::Entity")]
    Cards,
}

impl Related<super::card::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cards.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
