use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use tracing_subscriber::fmt::writer::MakeWriter;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9]{20,}|Bearer\s+[^\s]+|passcode[\x22']?\s*[:=]\s*[^\s,}]+)"
    )
    .expect("Invalid redaction regex");
}

/// Scrubs API keys and passcodes out of anything written through it. Wraps
/// the file appender so secrets never land in the log files.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = REDACTION_REGEX.replace_all(&input, "[REDACTED]");
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` adapter so the redacting wrapper can sit under a fmt layer.
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_tokens_and_passcodes_are_scrubbed() {
        let mut out = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut out);
            writer
                .write_all(b"header Bearer sk-abc123def456ghi789jkl012 sent, passcode: hunter2,")
                .expect("write succeeds");
        }
        let written = String::from_utf8(out).expect("utf8");
        assert!(!written.contains("sk-abc123"));
        assert!(!written.contains("hunter2"));
        assert!(written.contains("[REDACTED]"));
    }
}
