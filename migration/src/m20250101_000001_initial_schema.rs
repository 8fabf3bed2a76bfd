use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create clients table
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clients::ClientId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Clients::ClientSecret))
                    .col(string(Clients::Name))
                    .col(string(Clients::Grants)) // JSON-encoded Vec<String>
                    .col(big_integer_null(Clients::AccessTokenLifetime))
                    .col(big_integer_null(Clients::RefreshTokenLifetime))
                    .col(big_integer_null(Clients::MaxActiveSessions))
                    .col(
                        ColumnDef::new(Clients::FingerprintSecret)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(big_integer(Clients::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Subject)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Users::Username)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(Users::PasswordHash))
                    .col(string_null(Users::Email))
                    .col(
                        ColumnDef::new(Users::EmailVerified)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(Users::CreatedAt))
                    .col(
                        ColumnDef::new(Users::Enabled)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        // Create tokens table
        manager
            .create_table(
                Table::create()
                    .table(Tokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tokens::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Tokens::AccessToken)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(big_integer(Tokens::AccessTokenExpiresAt))
                    .col(
                        ColumnDef::new(Tokens::RefreshToken)
                            .string()
                            .null()
                            .unique_key(),
                    )
                    .col(big_integer_null(Tokens::RefreshTokenExpiresAt))
                    .col(string(Tokens::ClientId))
                    .col(string(Tokens::Subject))
                    .col(string(Tokens::Scope)) // JSON-encoded Vec<String>
                    .col(big_integer(Tokens::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tokens_client")
                            .from(Tokens::Table, Tokens::ClientId)
                            .to(Clients::Table, Clients::ClientId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tokens_subject")
                            .from(Tokens::Table, Tokens::Subject)
                            .to(Users::Table, Users::Subject)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create index on tokens.access_token_expires_at
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tokens_access_expires")
                    .table(Tokens::Table)
                    .col(Tokens::AccessTokenExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Create job_executions table with backend-specific ID type
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(JobExecutions::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(JobExecutions::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
pub(crate) enum Clients {
    Table,
    ClientId,
    ClientSecret,
    Name,
    Grants,
    AccessTokenLifetime,
    RefreshTokenLifetime,
    MaxActiveSessions,
    FingerprintSecret,
    CreatedAt,
}

#[derive(DeriveIden)]
pub(crate) enum Users {
    Table,
    Subject,
    Username,
    PasswordHash,
    Email,
    EmailVerified,
    CreatedAt,
    Enabled,
}

#[derive(DeriveIden)]
enum Tokens {
    Table,
    Id,
    AccessToken,
    AccessTokenExpiresAt,
    RefreshToken,
    RefreshTokenExpiresAt,
    ClientId,
    Subject,
    Scope,
    CreatedAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
