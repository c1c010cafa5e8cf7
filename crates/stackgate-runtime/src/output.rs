use stackgate_schema::EnvironmentId;
use std::io::Write;

pub const OUTPUT_PREFIX: &str = "o:";
pub const ERROR_PREFIX: &str = "e:";

/// Destination for human-readable progress of a provisioning run.
pub trait OutputSink {
    fn header(&mut self, msg: &str);

    fn message(&mut self, msg: &str);

    /// One line of raw engine output.
    fn output(&mut self, line: &str);

    fn error(&mut self, msg: &str);
}

/// Writes `o:`/`e:` prefixed lines to any writer.
pub struct PrefixedSink<W: Write> {
    writer: W,
}

impl<W: Write> PrefixedSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn line(&mut self, prefix: &str, msg: &str) {
        // A closed pipe must not abort a provisioning run.
        let _ = writeln!(self.writer, "{prefix} {msg}");
        let _ = self.writer.flush();
    }
}

impl PrefixedSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> OutputSink for PrefixedSink<W> {
    fn header(&mut self, msg: &str) {
        self.line(OUTPUT_PREFIX, &format!("==> {msg}"));
    }

    fn message(&mut self, msg: &str) {
        self.line(OUTPUT_PREFIX, msg);
    }

    fn output(&mut self, line: &str) {
        self.line(OUTPUT_PREFIX, line);
    }

    fn error(&mut self, msg: &str) {
        self.line(ERROR_PREFIX, msg);
    }
}

/// Forwards progress into the tracing subscriber, tagged with the environment.
pub struct TracingSink {
    env_id: EnvironmentId,
}

impl TracingSink {
    pub fn new(env_id: EnvironmentId) -> Self {
        Self { env_id }
    }
}

impl OutputSink for TracingSink {
    fn header(&mut self, msg: &str) {
        tracing::info!(env_id = %self.env_id, "==> {msg}");
    }

    fn message(&mut self, msg: &str) {
        tracing::info!(env_id = %self.env_id, "{msg}");
    }

    fn output(&mut self, line: &str) {
        tracing::debug!(env_id = %self.env_id, "{line}");
    }

    fn error(&mut self, msg: &str) {
        tracing::warn!(env_id = %self.env_id, "{msg}");
    }
}

/// Buffers every line in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    pub lines: Vec<String>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

impl OutputSink for CaptureSink {
    fn header(&mut self, msg: &str) {
        self.lines.push(format!("{OUTPUT_PREFIX} ==> {msg}"));
    }

    fn message(&mut self, msg: &str) {
        self.lines.push(format!("{OUTPUT_PREFIX} {msg}"));
    }

    fn output(&mut self, line: &str) {
        self.lines.push(format!("{OUTPUT_PREFIX} {line}"));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push(format!("{ERROR_PREFIX} {msg}"));
    }
}
