//! `revtrail revision` command implementation.

use anyhow::{Context, Result, bail};
use revtrail_audit::{AuditStore, reconstruct};
use revtrail_core::EntityRef;
use std::path::Path;

pub async fn run(log: &Path, entity_type: &str, id: i64, version: Option<u64>) -> Result<()> {
    let store = super::open_log(log)?;
    let entity = EntityRef::new(entity_type, id);

    let records = store.records_for(&entity).await?;
    let Some(latest) = records.last().map(|record| record.version) else {
        bail!("No audit records for {}", entity);
    };

    let target = version.unwrap_or(latest);
    let revision = reconstruct(&records, target)
        .with_context(|| format!("Failed to reconstruct {} at version {}", entity, target))?;

    println!("{} v{} ({})", revision.entity, revision.version, revision.action);
    if !revision.persisted {
        println!("Note: {} has been destroyed; this state no longer exists.", entity);
    }
    if revision.degraded {
        println!("Note: some records had unreadable diffs and were skipped.");
    }
    println!("{}", serde_json::to_string_pretty(&revision.attributes)?);

    Ok(())
}
