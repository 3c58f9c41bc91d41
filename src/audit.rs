//! The audit log: one line per suspension, warning, or per-staff error of a run.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

pub(crate) struct AuditLog<W: Write> {
    out: W,
}

impl AuditLog<BufWriter<File>> {
    /// Create the audit log, truncating the log of the last run.
    pub fn create(path: &Path) -> Result<Self, std::io::Error> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> AuditLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Append a timestamped line. The line is on disk when this returns.
    pub fn record(&mut self, line: &str) -> Result<(), std::io::Error> {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        writeln!(self.out, "{now} {line}")?;
        self.out.flush()
    }

    pub fn flush(&mut self) -> Result<(), std::io::Error> {
        self.out.flush()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}
