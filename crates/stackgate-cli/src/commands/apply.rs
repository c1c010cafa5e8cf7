use super::{report_change, resolve_env, sink_for, spin_fail, spin_ok, OutputMode};
use stackgate_core::Engine;
use stackgate_schema::ChangeId;

pub fn run(
    engine: &Engine,
    env: &str,
    change: Option<u64>,
    mode: OutputMode,
) -> Result<u8, String> {
    let id = resolve_env(engine, env)?;
    let pb = mode.spinner("applying...");
    let mut sink = sink_for(mode);

    match engine.apply(id, change.map(ChangeId::new), sink.as_mut()) {
        Ok(change) => {
            if let Some(ref pb) = pb {
                if change.status.is_failure() {
                    spin_fail(pb, &format!("change {} {}", change.id, change.status));
                } else {
                    spin_ok(pb, &format!("change {} {}", change.id, change.status));
                }
            }
            report_change(&change, mode)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "apply failed");
            }
            Err(e.to_string())
        }
    }
}
