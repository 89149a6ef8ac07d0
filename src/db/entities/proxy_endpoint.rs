use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A configured HTTP or SOCKS5 tunnel. Health counters are advisory and
/// written through from the in-memory registry after every attempt;
/// last-write-wins is acceptable here.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "proxy_endpoints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// "http" or "socks5"
    pub kind: String,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub enabled: bool,
    pub success_count: i64,
    pub fail_count: i64,
    pub avg_response_ms: Option<f64>,
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
