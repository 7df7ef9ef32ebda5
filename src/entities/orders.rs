//! SeaORM entity for the orders table
//!
//! Single writer after admission is the worker driving the lifecycle state
//! machine; the subscription and polling handlers only read.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_type: String,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: String,
    pub slippage: String,
    pub status: String,
    pub amount_out: Option<String>,
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub expected_price: Option<String>,
    pub executed_price: Option<String>,
    pub quotes: Json,
    pub logs: Json,
    pub correlation_id: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
