use super::{report_change, resolve_env, sink_for, spin_fail, spin_ok, OutputMode};
use stackgate_core::Engine;
use stackgate_schema::Revision;

pub fn run(engine: &Engine, env: &str, revision: &str, mode: OutputMode) -> Result<u8, String> {
    let id = resolve_env(engine, env)?;
    let pb = mode.spinner(&format!("planning {revision}..."));
    let mut sink = sink_for(mode);

    match engine.plan(id, Revision::new(revision), sink.as_mut()) {
        Ok(change) => {
            if let Some(ref pb) = pb {
                if change.status.is_failure() {
                    spin_fail(pb, &format!("{} {}", change.revision, change.status));
                } else {
                    spin_ok(pb, &format!("{} {}", change.revision, change.status));
                }
            }
            report_change(&change, mode)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "plan failed");
            }
            Err(e.to_string())
        }
    }
}
