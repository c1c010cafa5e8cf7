use super::{json_pretty, OutputMode, EXIT_STORE_ERROR, EXIT_SUCCESS};
use stackgate_core::Engine;

pub fn run(engine: &Engine, mode: OutputMode) -> Result<u8, String> {
    let report = engine
        .verify_store()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "store error: no on-disk store configured".to_owned())?;

    if mode.json {
        let payload = serde_json::json!({
            "checked": report.checked,
            "passed": report.passed,
            "failed": report.failed.iter().map(|f| serde_json::json!({
                "entry": f.entry,
                "reason": f.reason,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "store integrity: {}/{} environment records passed",
            report.passed, report.checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.entry, f.reason);
        }
    }

    if report.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
