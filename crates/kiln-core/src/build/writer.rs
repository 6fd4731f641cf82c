//! Build log writer that turns raw engine output into progress updates.

use std::io::{self, Write};

use tokio::sync::mpsc::UnboundedSender;

use super::{BuildStatus, BuildUpdate};

/// Splits written bytes into lines and forwards each non-empty line as an
/// `InProgress` update for one service.
pub struct UpdateWriter {
    service_name: String,
    updates: UnboundedSender<BuildUpdate>,
    pending: Vec<u8>,
}

impl UpdateWriter {
    pub fn new(service_name: impl Into<String>, updates: UnboundedSender<BuildUpdate>) -> Self {
        Self {
            service_name: service_name.into(),
            updates,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r').trim_end();
        if text.is_empty() {
            return;
        }
        // A closed receiver means nobody is watching; the build carries on.
        let _ = self.updates.send(BuildUpdate {
            service_name: self.service_name.clone(),
            message: text.to_string(),
            status: BuildStatus::InProgress,
            error: None,
        });
    }
}

impl Write for UpdateWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        Ok(())
    }
}

impl Drop for UpdateWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn splits_lines_across_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = UpdateWriter::new("svc", tx);
        writer.write_all(b"Step 1/3 : FROM node\nStep 2").unwrap();
        writer.write_all(b"/3 : COPY . .\r\n\n").unwrap();
        writer.write_all(b"done").unwrap();
        drop(writer);

        let messages: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|u| {
                assert_eq!(u.status, BuildStatus::InProgress);
                assert_eq!(u.service_name, "svc");
                u.message
            })
            .collect();
        assert_eq!(
            messages,
            vec!["Step 1/3 : FROM node", "Step 2/3 : COPY . .", "done"]
        );
    }
}
