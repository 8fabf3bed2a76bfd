use sea_orm_migration::{prelude::*, schema::*};

use crate::m20250101_000001_initial_schema::{Clients, Users};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create licenses table
        manager
            .create_table(
                Table::create()
                    .table(Licenses::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Licenses::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Licenses::ClientId))
                    .col(string(Licenses::Subject))
                    .col(big_integer(Licenses::ExpiresAt))
                    .col(
                        ColumnDef::new(Licenses::NumActivated)
                            .big_integer()
                            .not_null()
                            .default(0)
                            .check(Expr::col(Licenses::NumActivated).gte(0)),
                    )
                    .col(big_integer(Licenses::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_licenses_client")
                            .from(Licenses::Table, Licenses::ClientId)
                            .to(Clients::Table, Clients::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_licenses_subject")
                            .from(Licenses::Table, Licenses::Subject)
                            .to(Users::Table, Users::Subject)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One license per (client, user) pair
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_licenses_client_subject")
                    .table(Licenses::Table)
                    .col(Licenses::ClientId)
                    .col(Licenses::Subject)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create activations table
        manager
            .create_table(
                Table::create()
                    .table(Activations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Activations::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Activations::Hwid)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(Activations::LicenseId))
                    .col(string(Activations::Arch))
                    .col(string(Activations::Cpus)) // JSON-encoded Vec<String>
                    .col(string(Activations::Endianness))
                    .col(string(Activations::Platform))
                    .col(string(Activations::Username))
                    .col(string(Activations::Hostname))
                    .col(big_integer(Activations::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_activations_license")
                            .from(Activations::Table, Activations::LicenseId)
                            .to(Licenses::Table, Licenses::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_activations_license")
                    .table(Activations::Table)
                    .col(Activations::LicenseId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Activations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Licenses::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Licenses {
    Table,
    Id,
    ClientId,
    Subject,
    ExpiresAt,
    NumActivated,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Activations {
    Table,
    Id,
    Hwid,
    LicenseId,
    Arch,
    Cpus,
    Endianness,
    Platform,
    Username,
    Hostname,
    CreatedAt,
}
