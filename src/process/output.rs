//! Line scanning of child output with the ready-keyword state machine.
use serde_json::json;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::EventBus;
use crate::util::encoding::decode_output;

/// Longest line forwarded as one event; longer runs are split into pieces.
pub const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Streaming,
    KeywordMatched,
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineVerdict {
    pub emit: bool,
    /// This line carried the keyword (first match only).
    pub started: bool,
}

/// Decides per line whether to forward it. The keyword line itself is
/// forwarded; later lines are dropped unless `keep_after` is set.
#[derive(Debug, Clone)]
pub struct OutputFilter {
    keyword: String,
    keep_after: bool,
    state: ScanState,
}

impl OutputFilter {
    pub fn new(keyword: &str, keep_after: bool) -> Self {
        OutputFilter {
            keyword: keyword.to_string(),
            keep_after,
            state: ScanState::Streaming,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn feed(&mut self, line: &str) -> LineVerdict {
        match self.state {
            ScanState::Streaming => {
                let hit = !self.keyword.is_empty() && line.contains(self.keyword.as_str());
                if hit {
                    self.state = ScanState::KeywordMatched;
                }
                LineVerdict {
                    emit: true,
                    started: hit,
                }
            }
            ScanState::KeywordMatched if self.keep_after => LineVerdict {
                emit: true,
                started: false,
            },
            ScanState::KeywordMatched | ScanState::Suppressed => {
                self.state = ScanState::Suppressed;
                LineVerdict {
                    emit: false,
                    started: false,
                }
            }
        }
    }
}

/// Per-process scanning context shared by the stdout and stderr scanners.
pub(crate) struct ScanShared {
    pub bus: Arc<dyn EventBus>,
    pub out_event: String,
    pub convert: bool,
    pub filter: Mutex<OutputFilter>,
    pub started: Arc<AtomicBool>,
}

/// Read `reader` to EOF line by line, forwarding lines per the shared filter.
/// A line over `MAX_LINE` bytes counts as several. Returns the number of lines read.
pub(crate) fn scan_lines<R: Read>(reader: R, shared: &ScanShared) -> usize {
    let mut rd = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match (&mut rd).take(MAX_LINE as u64).read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(event = %shared.out_event, "output read ended: {e}");
                break;
            }
        }
        count += 1;
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        let text = decode_output(&buf, shared.convert);
        let verdict = match shared.filter.lock() {
            Ok(mut f) => f.feed(&text),
            Err(p) => p.into_inner().feed(&text),
        };
        if verdict.started {
            shared.started.store(true, Ordering::SeqCst);
        }
        if verdict.emit && !shared.out_event.is_empty() {
            shared.bus.emit(&shared.out_event, vec![json!(text)]);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LocalBus;
    use std::io::Cursor;

    #[test]
    fn test_keyword_line_emitted_then_suppressed() {
        let mut f = OutputFilter::new("started", false);
        assert!(f.feed("booting").emit);
        let v = f.feed("core started ok");
        assert!(v.emit && v.started);
        assert_eq!(f.state(), ScanState::KeywordMatched);
        assert!(!f.feed("after").emit);
        assert_eq!(f.state(), ScanState::Suppressed);
        assert!(!f.feed("started again").started);
    }

    #[test]
    fn test_keep_after_keyword_keeps_streaming() {
        let mut f = OutputFilter::new("ready", true);
        assert!(f.feed("ready").started);
        assert!(f.feed("more").emit);
        assert!(!f.feed("ready").started);
        assert_eq!(f.state(), ScanState::KeywordMatched);
    }

    #[test]
    fn test_no_keyword_streams_everything() {
        let mut f = OutputFilter::new("", false);
        for line in ["a", "b", ""] {
            let v = f.feed(line);
            assert!(v.emit && !v.started);
        }
    }

    #[test]
    fn test_scan_lines_strips_crlf_and_sets_started() {
        let (bus, rx) = LocalBus::new();
        let shared = ScanShared {
            bus,
            out_event: "out".into(),
            convert: false,
            filter: Mutex::new(OutputFilter::new("up", false)),
            started: Arc::new(AtomicBool::new(false)),
        };
        let n = scan_lines(Cursor::new(b"one\r\nis up\nhidden\nlast".to_vec()), &shared);
        assert_eq!(n, 4);
        assert!(shared.started.load(Ordering::SeqCst));
        let lines: Vec<_> = rx.try_iter().map(|e| e.args[0].clone()).collect();
        assert_eq!(lines, vec![json!("one"), json!("is up")]);
    }

    #[test]
    fn test_overlong_line_is_split() {
        let (bus, rx) = LocalBus::new();
        let shared = ScanShared {
            bus,
            out_event: "out".into(),
            convert: false,
            filter: Mutex::new(OutputFilter::new("", false)),
            started: Arc::new(AtomicBool::new(false)),
        };
        let mut input = vec![b'x'; MAX_LINE * 2 + 10];
        input.extend_from_slice(b"\nnext\n");
        let n = scan_lines(Cursor::new(input), &shared);
        assert_eq!(n, 4);
        let sizes: Vec<_> = rx
            .try_iter()
            .map(|e| e.args[0].as_str().unwrap_or_default().len())
            .collect();
        assert_eq!(sizes, vec![MAX_LINE, MAX_LINE, 10, 4]);
    }
}
