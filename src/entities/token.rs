use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique, column_type = "Text")]
    pub access_token: String,
    pub access_token_expires_at: i64,
    #[sea_orm(unique)]
    pub refresh_token: Option<String>,
    pub refresh_token_expires_at: Option<i64>,
    pub client_id: String,
    pub subject: String,
    pub scope: String, // JSON-encoded Vec<String>
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
