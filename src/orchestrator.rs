use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::Serialize;
use uuid::Uuid;

use crate::db::entities::{fetch_log, mail_account, proxy_endpoint, proxy_policy};
use crate::error::{FetchError, RedeemError};
use crate::ledger::{CardLedger, Requester};
use crate::proxy::health::HealthRegistry;
use crate::proxy::selector::{self, SelectionPolicy};
use crate::proxy::Candidate;
use crate::transport::message::MailRecord;
use crate::transport::{FetchBatch, FetchFilter, MailFetcher};

/// What a successful redemption returns to the caller.
#[derive(Debug, Serialize)]
pub struct FetchOutcome {
    pub account_email: String,
    pub records: Vec<MailRecord>,
    pub parse_failures: u32,
    pub remaining_uses: i32,
    pub route: String,
}

/// Result of an on-demand account connectivity test.
#[derive(Debug, Serialize)]
pub struct TestReport {
    pub ok: bool,
    pub error: Option<String>,
}

/// Drives one redemption end to end: charge the card, resolve the
/// account, pick a route, fetch with failover, audit everything.
pub struct RetrievalService {
    db: DatabaseConnection,
    ledger: CardLedger,
    registry: Arc<HealthRegistry>,
    fetcher: Arc<dyn MailFetcher>,
}

impl RetrievalService {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<HealthRegistry>,
        fetcher: Arc<dyn MailFetcher>,
    ) -> Self {
        Self {
            ledger: CardLedger::new(db.clone()),
            db,
            registry,
            fetcher,
        }
    }

    /// The card use is charged before any network work and is not
    /// refunded on downstream failure; failures are audited instead.
    pub async fn redeem_and_fetch(
        &self,
        card_key: &str,
        requester: &Requester,
    ) -> Result<FetchOutcome, FetchError> {
        let redeemed = self
            .ledger
            .redeem(card_key, requester)
            .await
            .map_err(|err| match err {
                RedeemError::Rejected(reason) => FetchError::CardRejected(reason),
                RedeemError::Db(err) => FetchError::Db(err),
            })?;

        let account = match redeemed.mail_account_id {
            Some(id) => mail_account::Entity::find_by_id(id).one(&self.db).await?,
            None => None,
        };
        let Some(account) = account.filter(|a| a.enabled) else {
            self.log_failure("(unbound)", "mail account missing or disabled")
                .await?;
            return Err(FetchError::AccountUnavailable);
        };

        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            self.log_failure(&account.email, "no proxy candidates available")
                .await?;
            return Err(FetchError::NoRoute);
        }

        let filter = FetchFilter {
            lookback_days: redeemed.lookback_days,
            sender_allowlist: redeemed.sender_allowlist.clone(),
        };

        for candidate in &candidates {
            let started = Instant::now();
            match self.fetcher.fetch(&account, candidate, &filter).await {
                Ok(batch) => {
                    self.report(candidate, true, started).await;
                    self.log_batch(&account.email, &batch).await?;
                    tracing::info!(
                        account = %account.email,
                        route = %candidate.describe(),
                        messages = batch.records.len(),
                        "fetch succeeded"
                    );
                    return Ok(FetchOutcome {
                        account_email: account.email.clone(),
                        records: batch.records,
                        parse_failures: batch.parse_failures,
                        remaining_uses: redeemed.remaining_uses,
                        route: candidate.describe(),
                    });
                }
                Err(err) if !err.is_retryable() => {
                    // The tunnel worked; the mailbox rejected the
                    // credentials. Another route cannot change that.
                    self.report(candidate, true, started).await;
                    self.log_failure(&account.email, &err.to_string()).await?;
                    return Err(FetchError::AuthFailed(err.to_string()));
                }
                Err(err) => {
                    self.report(candidate, false, started).await;
                    tracing::warn!(
                        account = %account.email,
                        route = %candidate.describe(),
                        "attempt failed, trying next route: {err}"
                    );
                }
            }
        }

        self.log_failure(&account.email, "all routes failed").await?;
        Err(FetchError::NoRoute)
    }

    /// Connectivity check for one account, outside any card. Follows the
    /// same route selection as a fetch and records the result on the row.
    pub async fn test_account(&self, account_id: Uuid) -> Result<TestReport, FetchError> {
        let account = mail_account::Entity::find_by_id(account_id)
            .one(&self.db)
            .await?
            .ok_or(FetchError::AccountUnavailable)?;

        let candidates = self.candidates().await?;
        let mut last_error = "no proxy candidates available".to_string();
        let mut ok = false;
        for candidate in &candidates {
            let started = Instant::now();
            match self.fetcher.test_connection(&account, candidate).await {
                Ok(()) => {
                    self.report(candidate, true, started).await;
                    ok = true;
                    break;
                }
                Err(err) => {
                    self.report(candidate, !err.is_retryable(), started).await;
                    last_error = err.to_string();
                    if !err.is_retryable() {
                        break;
                    }
                }
            }
        }

        let mut active: mail_account::ActiveModel = account.into();
        active.last_tested_at = Set(Some(Utc::now()));
        active.last_test_ok = Set(Some(ok));
        active.update(&self.db).await?;

        Ok(TestReport {
            ok,
            error: (!ok).then_some(last_error),
        })
    }

    /// Load policy and endpoints fresh, sync the registry, build the
    /// ordered candidate list.
    async fn candidates(&self) -> Result<Vec<Candidate>, FetchError> {
        let policy =
            SelectionPolicy::from_model(proxy_policy::Entity::find_by_id(1).one(&self.db).await?);
        let endpoints = proxy_endpoint::Entity::find().all(&self.db).await?;
        self.registry.sync_endpoints(&endpoints).await;
        let health = self.registry.view().await;
        Ok(selector::select(&policy, &endpoints, &health))
    }

    /// Health accounting, tunnels only; a direct attempt has no endpoint
    /// to charge.
    async fn report(&self, candidate: &Candidate, success: bool, started: Instant) {
        if let Candidate::Tunnel(spec) = candidate {
            self.registry
                .record(spec.key(), success, started.elapsed())
                .await;
        }
    }

    async fn log_batch(&self, account_email: &str, batch: &FetchBatch) -> Result<(), FetchError> {
        for record in &batch.records {
            fetch_log::ActiveModel {
                id: Set(Uuid::new_v4()),
                account_email: Set(account_email.to_string()),
                subject: Set(Some(record.subject.clone())),
                from_addr: Set(Some(record.from_addr.clone())),
                to_addr: Set(Some(record.to.clone())),
                received_at: Set(record.date),
                status: Set("received".to_string()),
                error: Set(None),
                created_at: Set(Utc::now()),
            }
            .insert(&self.db)
            .await?;
        }
        Ok(())
    }

    async fn log_failure(&self, account_email: &str, error: &str) -> Result<(), FetchError> {
        fetch_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            account_email: Set(account_email.to_string()),
            subject: Set(None),
            from_addr: Set(None),
            to_addr: Set(None),
            received_at: Set(None),
            status: Set("failed".to_string()),
            error: Set(Some(error.to_string())),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::card;
    use crate::error::{RejectReason, TransportError};
    use crate::migration::Migrator;
    use async_trait::async_trait;
    use sea_orm::{ColumnTrait, ConnectOptions, Database, QueryFilter};
    use sea_orm_migration::MigratorTrait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<FetchBatch, TransportError>>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchBatch, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _account: &mail_account::Model,
            candidate: &Candidate,
            _filter: &FetchFilter,
        ) -> Result<FetchBatch, TransportError> {
            self.attempts.lock().unwrap().push(candidate.describe());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Tunnel("script exhausted".into())))
        }

        async fn test_connection(
            &self,
            account: &mail_account::Model,
            candidate: &Candidate,
        ) -> Result<(), TransportError> {
            self.fetch(
                account,
                candidate,
                &FetchFilter {
                    lookback_days: 1,
                    sender_allowlist: Vec::new(),
                },
            )
            .await
            .map(|_| ())
        }
    }

    async fn setup_db() -> DatabaseConnection {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1);
        let db = Database::connect(options).await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn insert_account(db: &DatabaseConnection, enabled: bool) -> mail_account::Model {
        mail_account::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set("inbox@service.test".to_string()),
            username: Set("inbox@service.test".to_string()),
            password: Set("secret".to_string()),
            server: Set("mail.service.test".to_string()),
            port: Set(993),
            protocol: Set("imap".to_string()),
            use_ssl: Set(true),
            enabled: Set(enabled),
            last_tested_at: Set(None),
            last_test_ok: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap()
    }

    async fn insert_card(db: &DatabaseConnection, key: &str, account: Option<Uuid>) {
        card::ActiveModel {
            id: Set(Uuid::new_v4()),
            card_key: Set(key.to_string()),
            usage_limit: Set(5),
            used_count: Set(0),
            status: Set("active".to_string()),
            expires_at: Set(None),
            mail_account_id: Set(account),
            lookback_days: Set(1),
            sender_allowlist: Set(String::new()),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();
    }

    async fn insert_endpoint(db: &DatabaseConnection, n: u128) {
        proxy_endpoint::ActiveModel {
            id: Set(Uuid::from_u128(n)),
            kind: Set("http".to_string()),
            name: Set(format!("proxy-{n}")),
            host: Set(format!("host-{n}")),
            port: Set(1080),
            username: Set(None),
            password: Set(None),
            enabled: Set(true),
            success_count: Set(0),
            fail_count: Set(0),
            avg_response_ms: Set(None),
            last_checked_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();
    }

    async fn set_policy(db: &DatabaseConnection, proxy_enabled: bool) {
        proxy_policy::ActiveModel {
            id: Set(1),
            proxy_enabled: Set(proxy_enabled),
            pinned_kind: Set(None),
            pinned_id: Set(None),
            updated_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();
    }

    fn service(db: &DatabaseConnection, fetcher: Arc<ScriptedFetcher>) -> RetrievalService {
        RetrievalService::new(db.clone(), Arc::new(HealthRegistry::new(3)), fetcher)
    }

    async fn used_count(db: &DatabaseConnection, key: &str) -> i32 {
        card::Entity::find()
            .filter(card::Column::CardKey.eq(key))
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .used_count
    }

    #[tokio::test]
    async fn fails_over_across_proxies_in_order() {
        let db = setup_db().await;
        let account = insert_account(&db, true).await;
        insert_card(&db, "k-failover", Some(account.id)).await;
        set_policy(&db, true).await;
        for n in 1..=3 {
            insert_endpoint(&db, n).await;
        }

        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Err(TransportError::Tunnel("refused".into())),
            Err(TransportError::Timeout(std::time::Duration::from_secs(30))),
            Ok(FetchBatch::default()),
        ]));
        let registry = Arc::new(HealthRegistry::new(3));
        let service = RetrievalService::new(db.clone(), registry.clone(), fetcher.clone());

        let outcome = service
            .redeem_and_fetch("k-failover", &Requester::default())
            .await
            .unwrap();
        assert_eq!(outcome.route, "http host-3:1080");
        assert_eq!(
            fetcher.attempts(),
            vec!["http host-1:1080", "http host-2:1080", "http host-3:1080"]
        );

        // Every attempt reached the registry, failures and success alike.
        let view = registry.view().await;
        use crate::proxy::ProxyKind;
        assert_eq!(view[&(ProxyKind::Http, Uuid::from_u128(1))].fail_count, 1);
        assert_eq!(view[&(ProxyKind::Http, Uuid::from_u128(2))].fail_count, 1);
        assert_eq!(view[&(ProxyKind::Http, Uuid::from_u128(3))].success_count, 1);
    }

    #[tokio::test]
    async fn repeat_redemption_returns_the_same_window() {
        let db = setup_db().await;
        let account = insert_account(&db, true).await;
        insert_card(&db, "k-repeat", Some(account.id)).await;

        let record = MailRecord {
            subject: "Your code".to_string(),
            from: "a@x.io".to_string(),
            from_addr: "a@x.io".to_string(),
            to: "inbox@service.test".to_string(),
            date: Some(Utc::now()),
            body: "Code: 123456".to_string(),
            attachments: Vec::new(),
        };
        let batch = FetchBatch {
            records: vec![record],
            parse_failures: 0,
        };
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(batch.clone()),
            Ok(batch),
        ]));
        let service = service(&db, fetcher);

        let first = service
            .redeem_and_fetch("k-repeat", &Requester::default())
            .await
            .unwrap();
        let second = service
            .redeem_and_fetch("k-repeat", &Requester::default())
            .await
            .unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].subject, second.records[0].subject);
        assert_eq!(second.remaining_uses, first.remaining_uses - 1);
        assert_eq!(used_count(&db, "k-repeat").await, 2);
    }

    #[tokio::test]
    async fn auth_failure_stops_failover_and_keeps_the_charge() {
        let db = setup_db().await;
        let account = insert_account(&db, true).await;
        insert_card(&db, "k-auth", Some(account.id)).await;
        set_policy(&db, true).await;
        for n in 1..=3 {
            insert_endpoint(&db, n).await;
        }

        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(
            TransportError::AuthFailed("LOGIN rejected".into()),
        )]));
        let service = service(&db, fetcher.clone());

        let result = service
            .redeem_and_fetch("k-auth", &Requester::default())
            .await;
        assert!(matches!(result, Err(FetchError::AuthFailed(_))));
        assert_eq!(fetcher.attempts().len(), 1);
        assert_eq!(used_count(&db, "k-auth").await, 1);

        let failures = fetch_log::Entity::find()
            .filter(fetch_log::Column::Status.eq("failed"))
            .all(&db)
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn proxying_enabled_without_endpoints_is_no_route() {
        let db = setup_db().await;
        let account = insert_account(&db, true).await;
        insert_card(&db, "k-noroute", Some(account.id)).await;
        set_policy(&db, true).await;

        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchBatch::default())]));
        let service = service(&db, fetcher.clone());

        let result = service
            .redeem_and_fetch("k-noroute", &Requester::default())
            .await;
        assert!(matches!(result, Err(FetchError::NoRoute)));
        assert!(fetcher.attempts().is_empty());
    }

    #[tokio::test]
    async fn goes_direct_when_proxying_is_disabled() {
        let db = setup_db().await;
        let account = insert_account(&db, true).await;
        insert_card(&db, "k-direct", Some(account.id)).await;
        // No policy row at all: same as proxying disabled.

        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchBatch::default())]));
        let service = service(&db, fetcher.clone());

        let outcome = service
            .redeem_and_fetch("k-direct", &Requester::default())
            .await
            .unwrap();
        assert_eq!(outcome.route, "direct");
        assert_eq!(fetcher.attempts(), vec!["direct"]);
    }

    #[tokio::test]
    async fn disabled_account_is_unavailable_and_the_use_stays_charged() {
        let db = setup_db().await;
        let account = insert_account(&db, false).await;
        insert_card(&db, "k-acct", Some(account.id)).await;

        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let service = service(&db, fetcher.clone());

        let result = service
            .redeem_and_fetch("k-acct", &Requester::default())
            .await;
        assert!(matches!(result, Err(FetchError::AccountUnavailable)));
        assert!(fetcher.attempts().is_empty());
        assert_eq!(used_count(&db, "k-acct").await, 1);
    }

    #[tokio::test]
    async fn unbound_card_is_unavailable() {
        let db = setup_db().await;
        insert_card(&db, "k-unbound", None).await;

        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let service = service(&db, fetcher);

        let result = service
            .redeem_and_fetch("k-unbound", &Requester::default())
            .await;
        assert!(matches!(result, Err(FetchError::AccountUnavailable)));
    }

    #[tokio::test]
    async fn rejected_card_surfaces_the_reason() {
        let db = setup_db().await;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let service = service(&db, fetcher);

        let result = service
            .redeem_and_fetch("missing", &Requester::default())
            .await;
        assert!(matches!(
            result,
            Err(FetchError::CardRejected(RejectReason::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_account_records_the_outcome() {
        let db = setup_db().await;
        let account = insert_account(&db, true).await;

        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchBatch::default())]));
        let service = service(&db, fetcher);

        let report = service.test_account(account.id).await.unwrap();
        assert!(report.ok);

        let stored = mail_account::Entity::find_by_id(account.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_test_ok, Some(true));
        assert!(stored.last_tested_at.is_some());
    }
}
