//! Migration to create the jobs table backing the durable queue.
//!
//! At-least-once delivery: a job row survives worker crashes; leases are
//! conditional updates on `state`, recovery is driven by `locked_at`.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(pk_auto(Jobs::Id))
                    .col(uuid(Jobs::OrderId).not_null())
                    .col(json(Jobs::Payload).not_null())
                    .col(string(Jobs::State).not_null())
                    .col(integer(Jobs::Attempt).not_null().default(0))
                    .col(string(Jobs::CorrelationId).not_null())
                    .col(timestamp_with_time_zone(Jobs::NextRunAt).not_null())
                    .col(string_null(Jobs::LockedBy))
                    .col(timestamp_with_time_zone_null(Jobs::LockedAt))
                    .col(string_null(Jobs::LastError))
                    .col(timestamp_with_time_zone(Jobs::CreatedAt).not_null())
                    .col(timestamp_with_time_zone(Jobs::UpdatedAt).not_null())
                    .to_owned(),
            )
            .await?;

        // Lease scan: due jobs by state
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_state_next_run_at")
                    .table(Jobs::Table)
                    .col(Jobs::State)
                    .col(Jobs::NextRunAt)
                    .to_owned(),
            )
            .await?;

        // Enqueue idempotency: lookup by order id
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_order_id")
                    .table(Jobs::Table)
                    .col(Jobs::OrderId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    OrderId,
    Payload,
    State,
    Attempt,
    CorrelationId,
    NextRunAt,
    LockedBy,
    LockedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
