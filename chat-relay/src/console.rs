use std::io::{self, Write};

/// Whether the console loop should keep reading after a line is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Where operator-facing lines go.
pub trait Console: Send + Sync {
    fn display(&self, line: &str);
}

/// Writes each line to stdout and flushes so piped readers see it at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn display(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        // A closed stdout leaves nobody to tell.
        let _ = writeln!(stdout, "{line}").and_then(|()| stdout.flush());
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::Console;

    #[derive(Default)]
    pub(crate) struct RecordingConsole {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingConsole {
        pub(crate) fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        pub(crate) fn last(&self) -> Option<String> {
            self.lines.lock().unwrap().last().cloned()
        }
    }

    impl Console for RecordingConsole {
        fn display(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }
}
