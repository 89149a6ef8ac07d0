use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Single-row table (id = 1) holding the proxy selection policy.
/// Loaded fresh from the store on every fetch; the process never caches
/// a mutable copy.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "proxy_policy")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub proxy_enabled: bool,
    pub pinned_kind: Option<String>,
    pub pinned_id: Option<Uuid>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
