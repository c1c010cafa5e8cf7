use crate::output::OutputSink;
use crate::provisioner::{Invocation, Provisioner};
use crate::RuntimeError;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Drives the `terraform` binary.
///
/// State is restored from the state store into the invocation's state
/// artifact before the run and saved back afterwards, even when the run
/// fails, since a partial apply still records what it created.
pub struct TerraformProvisioner {
    binary: PathBuf,
}

impl Default for TerraformProvisioner {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
        }
    }
}

impl TerraformProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn restore_state(&self, inv: &Invocation<'_>) -> Result<(), RuntimeError> {
        if let Some(data) = inv.states.get(&inv.state_key)? {
            fs::write(&inv.state_path, data)?;
            tracing::debug!("restored state {} into {}", inv.state_key, inv.state_path.display());
        }
        Ok(())
    }

    fn save_state(&self, inv: &Invocation<'_>) -> Result<(), RuntimeError> {
        if inv.state_path.exists() {
            let data = fs::read(&inv.state_path)?;
            inv.states.put(&inv.state_key, &data)?;
            tracing::debug!("saved state {} ({} bytes)", inv.state_key, data.len());
        }
        Ok(())
    }

    fn run_streaming(
        &self,
        dir: &Path,
        args: &[String],
        sink: &mut dyn OutputSink,
        tee: Option<&mut File>,
    ) -> Result<(), RuntimeError> {
        tracing::debug!("terraform {}", args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RuntimeError::ExecFailed(format!(
                    "failed to spawn {}: {e}",
                    self.binary.display()
                ))
            })?;

        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stream) = stderr {
                let _ = stream.read_to_end(&mut buf);
            }
            buf
        });

        // stdout is drained to EOF whatever happens to the tee, so the engine
        // never sees a closed pipe.
        let mut tee = Tee::new(tee);
        let mut read_error = None;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        sink.output(&display_line(&line));
                        tee.write(&line);
                    }
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                }
            }
        }

        let status = child.wait();
        let stderr_bytes = stderr_reader.join().unwrap_or_default();
        for line in stderr_bytes.split_inclusive(|&b| b == b'\n') {
            sink.error(&display_line(line));
            tee.write(line);
        }

        let status = status?;
        if let Some(e) = read_error {
            return Err(e.into());
        }
        tee.finish()?;

        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::ExecFailed(format!(
                "terraform {} exited with {status}",
                args.first().map_or("", String::as_str)
            )))
        }
    }
}

/// Copies raw engine output into the output artifact. After the first write
/// error further writes are skipped; the error surfaces from `finish`.
struct Tee<'a> {
    file: Option<&'a mut File>,
    error: Option<io::Error>,
}

impl<'a> Tee<'a> {
    fn new(file: Option<&'a mut File>) -> Self {
        Self { file, error: None }
    }

    fn write(&mut self, bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(bytes) {
                self.error = Some(e);
            }
        }
    }

    fn finish(self) -> Result<(), RuntimeError> {
        self.error.map_or(Ok(()), |e| Err(e.into()))
    }
}

/// One output line for display: line ending stripped, invalid UTF-8 replaced.
fn display_line(raw: &[u8]) -> Cow<'_, str> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw)
}

/// Full argument list for an invocation. Commands that read or write state
/// get non-interactive flags, the state artifact path, and one `-var` per
/// binding; anything else is passed through untouched.
pub fn build_args(inv: &Invocation<'_>) -> Result<Vec<String>, RuntimeError> {
    let mut tokens = inv.args.iter();
    let Some(command) = tokens.next() else {
        return Err(RuntimeError::InvalidInvocation(
            "no command given".to_owned(),
        ));
    };

    let mut args = vec![command.clone()];
    if matches!(command.as_str(), "plan" | "apply" | "destroy" | "refresh") {
        args.push("-input=false".to_owned());
        args.push("-no-color".to_owned());
        if matches!(command.as_str(), "apply" | "destroy") {
            args.push("-auto-approve".to_owned());
        }
        args.push(format!("-state={}", inv.state_path.display()));
        for (name, value) in inv.variables {
            args.push("-var".to_owned());
            args.push(format!("{name}={value}"));
        }
    }
    args.extend(tokens.cloned());
    Ok(args)
}

/// Names of `variable "<name>"` blocks in the `.tf` files of `dir`.
/// Returns `None` when the directory holds no `.tf` files.
pub fn scan_declared_variables(dir: &Path) -> Result<Option<BTreeSet<String>>, RuntimeError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut found_config = false;
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tf") {
            continue;
        }
        found_config = true;
        let content = fs::read_to_string(&path)?;
        for line in content.lines() {
            if let Some(name) = parse_variable_line(line) {
                names.insert(name.to_owned());
            }
        }
    }
    Ok(found_config.then_some(names))
}

fn parse_variable_line(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("variable")?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    let name = &rest[..end];
    (!name.is_empty()).then_some(name)
}

impl Provisioner for TerraformProvisioner {
    fn name(&self) -> &'static str {
        "terraform"
    }

    fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn declared_inputs(&self, dir: &Path) -> Result<Option<BTreeSet<String>>, RuntimeError> {
        scan_declared_variables(dir)
    }

    fn run(
        &self,
        invocation: &Invocation<'_>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), RuntimeError> {
        let args = build_args(invocation)?;
        self.restore_state(invocation)?;
        let mut output = File::create(&invocation.output_path)?;

        sink.message("Initializing working directory...");
        let init_args: Vec<String> = ["init", "-input=false", "-no-color"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        if let Err(e) = self.run_streaming(&invocation.dir, &init_args, sink, None) {
            writeln!(output, "{e}")?;
            return Err(e);
        }

        let result = self.run_streaming(&invocation.dir, &args, sink, Some(&mut output));
        output.sync_all()?;
        let saved = self.save_state(invocation);
        result?;
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgate_schema::{EnvironmentId, StateKey};
    use stackgate_store::MemoryStateStore;
    use std::collections::BTreeMap;

    fn invocation<'a>(
        args: &[&str],
        vars: &'a BTreeMap<String, String>,
        states: &'a MemoryStateStore,
    ) -> Invocation<'a> {
        Invocation {
            dir: PathBuf::from("/work/prod"),
            variables: vars,
            state_key: StateKey::for_environment(EnvironmentId::new(1)),
            states,
            output_path: PathBuf::from("/work/prod/output"),
            state_path: PathBuf::from("/work/prod/state"),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn plan_args_bind_state_and_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("region".to_owned(), "eu-west-1".to_owned());
        vars.insert("count".to_owned(), "3".to_owned());
        let states = MemoryStateStore::new();
        let args = build_args(&invocation(&["plan"], &vars, &states)).unwrap();
        assert_eq!(
            args,
            vec![
                "plan",
                "-input=false",
                "-no-color",
                "-state=/work/prod/state",
                "-var",
                "count=3",
                "-var",
                "region=eu-west-1",
            ]
        );
    }

    #[test]
    fn apply_args_auto_approve() {
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let args = build_args(&invocation(&["apply"], &vars, &states)).unwrap();
        assert!(args.contains(&"-auto-approve".to_owned()));
    }

    #[test]
    fn unknown_commands_pass_through() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_owned(), "y".to_owned());
        let states = MemoryStateStore::new();
        let args = build_args(&invocation(&["fmt", "-check"], &vars, &states)).unwrap();
        assert_eq!(args, vec!["fmt", "-check"]);
    }

    #[test]
    fn empty_args_are_rejected() {
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        assert!(matches!(
            build_args(&invocation(&[], &vars, &states)),
            Err(RuntimeError::InvalidInvocation(_))
        ));
    }

    #[test]
    fn variable_lines_are_parsed() {
        assert_eq!(parse_variable_line("variable \"region\" {"), Some("region"));
        assert_eq!(parse_variable_line("  variable   \"count\"{}"), Some("count"));
        assert_eq!(parse_variable_line("resource \"aws_instance\" \"web\" {"), None);
        assert_eq!(parse_variable_line("variable \"\" {"), None);
        assert_eq!(parse_variable_line("# variable \"commented\""), None);
    }

    #[test]
    fn scan_collects_variables_across_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("variables.tf"),
            "variable \"region\" {\n  default = \"us-east-1\"\n}\nvariable \"count\" {}\n",
        )
        .unwrap();
        fs::write(dir.path().join("main.tf"), "resource \"null_resource\" \"a\" {}\n").unwrap();
        fs::write(dir.path().join("notes.md"), "variable \"ignored\"\n").unwrap();

        let names = scan_declared_variables(dir.path()).unwrap().unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["count".to_owned(), "region".to_owned()]
        );
    }

    #[test]
    fn scan_without_tf_files_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_declared_variables(dir.path()).unwrap().is_none());
        assert!(scan_declared_variables(&dir.path().join("missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_binary_fails_and_records_reason() {
        let dir = tempfile::tempdir().unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mut inv = invocation(&["plan"], &vars, &states);
        inv.dir = dir.path().to_path_buf();
        inv.output_path = dir.path().join("output");
        inv.state_path = dir.path().join("state");

        let tf = TerraformProvisioner::with_binary("/nonexistent/stackgate-terraform");
        assert!(!tf.available());
        let mut sink = crate::output::CaptureSink::new();
        let err = tf.run(&inv, &mut sink).unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
        let output = fs::read_to_string(dir.path().join("output")).unwrap();
        assert!(output.contains("failed to spawn"));
    }

    #[test]
    fn stored_state_is_restored_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let key = StateKey::for_environment(EnvironmentId::new(1));
        stackgate_store::StateStore::put(&states, &key, b"{\"serial\": 3}").unwrap();

        let mut inv = invocation(&["plan"], &vars, &states);
        inv.dir = dir.path().to_path_buf();
        inv.output_path = dir.path().join("output");
        inv.state_path = dir.path().join("state");

        let tf = TerraformProvisioner::with_binary("/nonexistent/stackgate-terraform");
        let mut sink = crate::output::CaptureSink::new();
        assert!(tf.run(&inv, &mut sink).is_err());
        assert_eq!(
            fs::read_to_string(dir.path().join("state")).unwrap(),
            "{\"serial\": 3}"
        );
    }

    #[cfg(unix)]
    fn fake_terraform(dir: &Path, apply_exit: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            r##"#!/bin/sh
case "$1" in
  init)
    echo "Initializing provider plugins..."
    ;;
  plan)
    printf 'line one\ncaf\351\nline three: 3 to add\n'
    echo "warning: deprecated attribute" >&2
    ;;
  apply)
    for arg in "$@"; do
      case "$arg" in
        -state=*) printf '{{"serial": 7}}' > "${{arg#-state=}}" ;;
      esac
    done
    echo "Apply complete! Resources: 3 added."
    exit {apply_exit}
    ;;
esac
"##
        );
        let path = dir.join("fake-terraform");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn bind_to(inv: &mut Invocation<'_>, work: &Path) {
        inv.dir = work.to_path_buf();
        inv.output_path = work.join("output");
        inv.state_path = work.join("state");
    }

    #[cfg(unix)]
    #[test]
    fn plan_output_is_captured_verbatim_including_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let tf = TerraformProvisioner::with_binary(fake_terraform(dir.path(), 0));
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mut inv = invocation(&["plan"], &vars, &states);
        bind_to(&mut inv, &work);

        let mut sink = crate::output::CaptureSink::new();
        tf.run(&inv, &mut sink).unwrap();

        assert_eq!(
            fs::read(work.join("output")).unwrap(),
            b"line one\ncaf\xe9\nline three: 3 to add\nwarning: deprecated attribute\n"
        );
        assert!(sink.contains("Initializing provider plugins"));
        assert!(sink.contains("caf\u{fffd}"));
        assert!(sink.contains("3 to add"));
        assert!(sink
            .lines
            .contains(&"e: warning: deprecated attribute".to_owned()));
        let key = StateKey::for_environment(EnvironmentId::new(1));
        assert!(stackgate_store::StateStore::get(&states, &key)
            .unwrap()
            .is_none());
    }

    #[cfg(unix)]
    #[test]
    fn apply_saves_state_under_environment_key() {
        let dir = tempfile::tempdir().unwrap();
        let tf = TerraformProvisioner::with_binary(fake_terraform(dir.path(), 0));
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mut inv = invocation(&["apply"], &vars, &states);
        bind_to(&mut inv, &work);

        let mut sink = crate::output::CaptureSink::new();
        tf.run(&inv, &mut sink).unwrap();

        let output = fs::read_to_string(work.join("output")).unwrap();
        assert!(output.contains("Apply complete! Resources: 3 added."));
        let key = StateKey::for_environment(EnvironmentId::new(1));
        assert_eq!(key.as_str(), "env-1");
        assert_eq!(
            stackgate_store::StateStore::get(&states, &key).unwrap(),
            Some(b"{\"serial\": 7}".to_vec())
        );
    }

    #[cfg(unix)]
    #[test]
    fn failed_apply_still_saves_state() {
        let dir = tempfile::tempdir().unwrap();
        let tf = TerraformProvisioner::with_binary(fake_terraform(dir.path(), 1));
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mut inv = invocation(&["apply"], &vars, &states);
        bind_to(&mut inv, &work);

        let mut sink = crate::output::CaptureSink::new();
        let err = tf.run(&inv, &mut sink).unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::ExecFailed(ref msg) if msg.contains("terraform apply exited")
        ));
        let key = StateKey::for_environment(EnvironmentId::new(1));
        assert_eq!(
            stackgate_store::StateStore::get(&states, &key).unwrap(),
            Some(b"{\"serial\": 7}".to_vec())
        );
    }

    #[cfg(unix)]
    #[test]
    fn artifact_write_failure_drains_output_before_failing() {
        let dir = tempfile::tempdir().unwrap();
        let tf = TerraformProvisioner::with_binary(fake_terraform(dir.path(), 0));
        let readonly = dir.path().join("readonly");
        fs::write(&readonly, "").unwrap();
        let mut tee = File::open(&readonly).unwrap();

        let mut sink = crate::output::CaptureSink::new();
        let err = tf
            .run_streaming(dir.path(), &["plan".to_owned()], &mut sink, Some(&mut tee))
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Io(_)));
        assert!(sink.contains("line three: 3 to add"));
        assert!(sink.contains("warning: deprecated attribute"));
    }
}
