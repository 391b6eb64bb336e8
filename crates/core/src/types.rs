/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A subject's attribute bag as handed over by the CRM data layer.
///
/// Always a JSON object; lookups on anything else find nothing.
pub type Attributes = serde_json::Value;
