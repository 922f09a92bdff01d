//! `revtrail history` command implementation.

use anyhow::Result;
use revtrail_audit::AuditStore;
use revtrail_core::EntityRef;
use std::path::Path;

pub async fn run(log: &Path, entity_type: &str, id: i64, json: bool) -> Result<()> {
    let store = super::open_log(log)?;
    let entity = EntityRef::new(entity_type, id);

    let records = store.records_for(&entity).await?;
    if records.is_empty() {
        println!("No audit records for {}", entity);
        return Ok(());
    }

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!("{}", record.to_log_line());
        }
    }

    Ok(())
}
