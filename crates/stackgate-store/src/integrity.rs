use crate::environments::FileEnvironmentStore;
use crate::layout::StoreLayout;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub entry: String,
    pub reason: String,
}

/// Re-read every environment record and verify its embedded checksum.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let store = FileEnvironmentStore::new(layout.clone());
    let results = store.list_with_errors()?;

    let mut report = IntegrityReport {
        checked: results.len(),
        ..Default::default()
    };

    for result in results {
        match result {
            Ok(_) => report.passed += 1,
            Err((entry, StoreError::IntegrityFailure { actual, .. })) => {
                report.failed.push(IntegrityFailure {
                    entry,
                    reason: format!("checksum mismatch: got {actual}"),
                });
            }
            Err((entry, e)) => {
                report.failed.push(IntegrityFailure {
                    entry,
                    reason: format!("read error: {e}"),
                });
            }
        }
    }

    Ok(report)
}
