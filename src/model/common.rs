use uuid::Uuid;

pub type Id = String;

/// Reserved field holding the record's primary key.
pub const PROP_ID: &str = "id";
/// Reserved field stamped on every confirmed mutation (epoch millis).
pub const PROP_LAST_UPDATED: &str = "lastUpdated";
/// Reserved field stamped when a record is first added (epoch millis).
pub const PROP_CREATED_AT: &str = "createdAt";

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time in epoch milliseconds; the unit used for the
/// `lastUpdated` / `createdAt` stamps written alongside every mutation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Transaction ids correlate the "local" and the terminal dispatch event of a
/// single attempted operation.
pub fn generate_transaction_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("t-{}-{}", &raw[..5], &raw[5..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_unique_and_prefixed() {
        let a = generate_transaction_id();
        let b = generate_transaction_id();
        assert!(a.starts_with("t-"));
        assert_ne!(a, b);
    }
}
