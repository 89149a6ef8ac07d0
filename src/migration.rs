use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(Migration001CreateTables)]
    }
}

pub struct Migration001CreateTables;

impl MigrationName for Migration001CreateTables {
    fn name(&self) -> &str {
        "m001_create_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration001CreateTables {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // mail_accounts table
        manager
            .create_table(
                Table::create()
                    .table(MailAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MailAccounts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::Email)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::Username)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(MailAccounts::Password).text().not_null())
                    .col(
                        ColumnDef::new(MailAccounts::Server)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::Port)
                            .integer()
                            .not_null()
                            .default(993),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::Protocol)
                            .string_len(10)
                            .not_null()
                            .default("imap"),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::UseSsl)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(MailAccounts::LastTestedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(MailAccounts::LastTestOk).boolean().null())
                    .col(
                        ColumnDef::new(MailAccounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // proxy_endpoints table
        manager
            .create_table(
                Table::create()
                    .table(ProxyEndpoints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProxyEndpoints::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::Kind)
                            .string_len(10)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::Name)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::Host)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProxyEndpoints::Port).integer().not_null())
                    .col(
                        ColumnDef::new(ProxyEndpoints::Username)
                            .string_len(255)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::Password)
                            .string_len(255)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::SuccessCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::FailCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::AvgResponseMs)
                            .double()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::LastCheckedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProxyEndpoints::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // proxy_policy table (single row, id = 1)
        manager
            .create_table(
                Table::create()
                    .table(ProxyPolicy::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProxyPolicy::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ProxyPolicy::ProxyEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(ProxyPolicy::PinnedKind).string_len(10).null())
                    .col(ColumnDef::new(ProxyPolicy::PinnedId).uuid().null())
                    .col(
                        ColumnDef::new(ProxyPolicy::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // cards table
        manager
            .create_table(
                Table::create()
                    .table(Cards::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Cards::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Cards::CardKey).string_len(255).not_null())
                    .col(
                        ColumnDef::new(Cards::UsageLimit)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Cards::UsedCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Cards::Status)
                            .string_len(20)
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Cards::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Cards::MailAccountId).uuid().null())
                    .col(
                        ColumnDef::new(Cards::LookbackDays)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Cards::SenderAllowlist)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Cards::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Cards::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Cards::Table, Cards::MailAccountId)
                            .to(MailAccounts::Table, MailAccounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // Unique index on card_key
        manager
            .create_index(
                Index::create()
                    .name("idx_cards_card_key")
                    .table(Cards::Table)
                    .col(Cards::CardKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // card_logs table (append-only; no FK so audit rows outlive cards)
        manager
            .create_table(
                Table::create()
                    .table(CardLogs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(CardLogs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(CardLogs::CardId).uuid().null())
                    .col(
                        ColumnDef::new(CardLogs::CardKeyDigest)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(ColumnDef::new(CardLogs::Action).string_len(10).not_null())
                    .col(ColumnDef::new(CardLogs::Outcome).text().not_null())
                    .col(ColumnDef::new(CardLogs::ClientIp).string_len(64).null())
                    .col(ColumnDef::new(CardLogs::UserAgent).string_len(255).null())
                    .col(
                        ColumnDef::new(CardLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_card_logs_digest")
                    .table(CardLogs::Table)
                    .col(CardLogs::CardKeyDigest)
                    .to_owned(),
            )
            .await?;

        // fetch_logs table (append-only)
        manager
            .create_table(
                Table::create()
                    .table(FetchLogs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(FetchLogs::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(FetchLogs::AccountEmail)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(FetchLogs::Subject).text().null())
                    .col(ColumnDef::new(FetchLogs::FromAddr).string_len(255).null())
                    .col(ColumnDef::new(FetchLogs::ToAddr).string_len(255).null())
                    .col(
                        ColumnDef::new(FetchLogs::ReceivedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(FetchLogs::Status).string_len(20).not_null())
                    .col(ColumnDef::new(FetchLogs::Error).text().null())
                    .col(
                        ColumnDef::new(FetchLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_fetch_logs_created")
                    .table(FetchLogs::Table)
                    .col(FetchLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FetchLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CardLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Cards::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProxyPolicy::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProxyEndpoints::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MailAccounts::Table).to_owned())
            .await?;
        Ok(())
    }
}

// ========== Table identifiers ==========

#[derive(Iden)]
enum MailAccounts {
    Table,
    Id,
    Email,
    Username,
    Password,
    Server,
    Port,
    Protocol,
    UseSsl,
    Enabled,
    LastTestedAt,
    LastTestOk,
    CreatedAt,
}

#[derive(Iden)]
enum ProxyEndpoints {
    Table,
    Id,
    Kind,
    Name,
    Host,
    Port,
    Username,
    Password,
    Enabled,
    SuccessCount,
    FailCount,
    AvgResponseMs,
    LastCheckedAt,
    CreatedAt,
}

#[derive(Iden)]
enum ProxyPolicy {
    Table,
    Id,
    ProxyEnabled,
    PinnedKind,
    PinnedId,
    UpdatedAt,
}

#[derive(Iden)]
enum Cards {
    Table,
    Id,
    CardKey,
    UsageLimit,
    UsedCount,
    Status,
    ExpiresAt,
    MailAccountId,
    LookbackDays,
    SenderAllowlist,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum CardLogs {
    Table,
    Id,
    CardId,
    CardKeyDigest,
    Action,
    Outcome,
    ClientIp,
    UserAgent,
    CreatedAt,
}

#[derive(Iden)]
enum FetchLogs {
    Table,
    Id,
    AccountEmail,
    Subject,
    FromAddr,
    ToAddr,
    ReceivedAt,
    Status,
    Error,
    CreatedAt,
}
