pub mod card;
pub mod card_log;
pub mod fetch_log;
pub mod mail_account;
pub mod proxy_endpoint;
pub mod proxy_policy;
