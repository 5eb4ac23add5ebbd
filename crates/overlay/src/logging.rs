//! Opt-in `tracing` subscriber.
//!
//! Hosts usually have no console. On Windows, events go to the debugger output
//! (`OutputDebugString`), viewable with DebugView or an attached debugger.

use tracing::level_filters::LevelFilter;

/// Install a global formatting subscriber at `level`.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(level: LevelFilter) -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_max_level(level)
        .with_writer(writer())
        .try_init()
        .map_err(|err| anyhow::anyhow!("subscriber init failed: {err}"))
}

#[cfg(windows)]
fn writer() -> dbg::DebugOutputWriter {
    dbg::DebugOutputWriter::new()
}

#[cfg(not(windows))]
fn writer() -> fn() -> std::io::Stderr {
    std::io::stderr
}

#[cfg(windows)]
mod dbg {
    use std::io::{self, Write};

    use parking_lot::{Mutex, MutexGuard};
    use tracing_subscriber::fmt::MakeWriter;
    use windows::{Win32::System::Diagnostics::Debug::OutputDebugStringW, core::PCWSTR};

    /// Writes each formatted event as one `OutputDebugStringW` call.
    pub struct DebugOutputWriter {
        line: Mutex<Vec<u16>>,
    }

    impl DebugOutputWriter {
        pub fn new() -> Self {
            Self {
                line: Mutex::new(Vec::new()),
            }
        }
    }

    impl<'a> MakeWriter<'a> for DebugOutputWriter {
        type Writer = EventWriter<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            EventWriter {
                line: self.line.lock(),
            }
        }
    }

    pub struct EventWriter<'a> {
        line: MutexGuard<'a, Vec<u16>>,
    }

    impl Write for EventWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.line
                .extend(String::from_utf8_lossy(buf).encode_utf16());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for EventWriter<'_> {
        fn drop(&mut self) {
            if self.line.is_empty() {
                return;
            }

            self.line.push(0);
            // SAFETY: null terminated above
            unsafe {
                OutputDebugStringW(PCWSTR(self.line.as_ptr()));
            }
            self.line.clear();
        }
    }
}
