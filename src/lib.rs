pub mod config;
pub mod environment;
pub mod routes;
pub mod session;
pub mod tracker;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
