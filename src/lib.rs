pub mod config;
pub mod evaluation;
pub mod language;
pub mod lifecycle;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod submission;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
