use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One run of a maintenance job from `jobs`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_executions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub job_name: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<i64>,
    pub error_message: Option<String>,
    /// Tokens deleted or activation slots released.
    pub records_processed: Option<i64>,
}

impl Model {
    /// `None` while the job is still running.
    pub fn outcome(&self) -> Option<bool> {
        self.success.map(|s| s != 0)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
