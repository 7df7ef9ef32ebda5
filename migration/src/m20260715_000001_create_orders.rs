//! Migration to create the orders table.
//!
//! One row per submitted order; the worker is the only writer after
//! admission. `logs` and `quotes` are JSON columns appended atomically with
//! each status transition.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Orders::Table)
                    .if_not_exists()
                    .col(uuid(Orders::Id).primary_key())
                    .col(string(Orders::OrderType).not_null())
                    .col(string(Orders::TokenIn).not_null())
                    .col(string(Orders::TokenOut).not_null())
                    .col(string(Orders::AmountIn).not_null())
                    .col(string(Orders::Slippage).not_null())
                    .col(string(Orders::Status).not_null())
                    .col(string_null(Orders::AmountOut))
                    .col(string_null(Orders::DexUsed))
                    .col(string_null(Orders::TxHash))
                    .col(string_null(Orders::FailureReason))
                    .col(string_null(Orders::ExpectedPrice))
                    .col(string_null(Orders::ExecutedPrice))
                    .col(json(Orders::Quotes).not_null())
                    .col(json(Orders::Logs).not_null())
                    .col(string(Orders::CorrelationId).not_null())
                    .col(timestamp_with_time_zone(Orders::CreatedAt).not_null())
                    .col(timestamp_with_time_zone(Orders::UpdatedAt).not_null())
                    .to_owned(),
            )
            .await?;

        // Index for the janitor's stale-pending scan
        manager
            .create_index(
                Index::create()
                    .name("idx_orders_status_created_at")
                    .table(Orders::Table)
                    .col(Orders::Status)
                    .col(Orders::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Orders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Orders {
    Table,
    Id,
    OrderType,
    TokenIn,
    TokenOut,
    AmountIn,
    Slippage,
    Status,
    AmountOut,
    DexUsed,
    TxHash,
    FailureReason,
    ExpectedPrice,
    ExecutedPrice,
    Quotes,
    Logs,
    CorrelationId,
    CreatedAt,
    UpdatedAt,
}
