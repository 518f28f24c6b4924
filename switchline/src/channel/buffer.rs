//! Output buffer with ANSI stripping and pagination tracking.
//!
//! Decoded application bytes from the device accumulate here while a
//! command runs. Prompt detection only ever looks at the last line, and
//! pager markers are counted once each, so the buffer remembers how far
//! it has already scanned.

use std::borrow::Cow;

use memchr::memmem;

use super::normalize::clean_line;

/// Marker a device prints when it pauses output for a keypress.
pub const PAGER_MARKER: &str = "--More--";

const ESC: u8 = 0x1b;

/// Buffer for accumulating one command's output.
#[derive(Debug)]
pub struct OutputBuffer {
    /// The accumulated output buffer.
    buffer: Vec<u8>,

    /// Offset before which every pager marker has been answered.
    pager_scan: usize,
}

impl OutputBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            pager_scan: 0,
        }
    }

    /// Extend the buffer with new data, stripping ANSI escape codes.
    pub fn extend(&mut self, data: &[u8]) {
        // Only run the VT parser when an escape is present so tabs,
        // carriage returns and backspaces survive in plain output.
        if memchr::memchr(ESC, data).is_some() {
            let cleaned = strip_ansi_escapes::strip(data);
            self.buffer.extend_from_slice(&cleaned);
        } else {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Count pager markers that arrived since the last call.
    ///
    /// Each marker is reported exactly once, even when it was split
    /// across two reads.
    pub fn take_pager_markers(&mut self) -> usize {
        let finder = memmem::Finder::new(PAGER_MARKER.as_bytes());
        let mut count = 0;
        while let Some(pos) = finder.find(&self.buffer[self.pager_scan..]) {
            count += 1;
            self.pager_scan += pos + PAGER_MARKER.len();
        }
        // A partial marker may still be completed by the next read.
        let keep = PAGER_MARKER.len() - 1;
        self.pager_scan = self.pager_scan.max(self.buffer.len().saturating_sub(keep));
        count
    }

    /// The last line of the buffer with control noise removed.
    pub fn last_line(&self) -> String {
        let start = memchr::memrchr(b'\n', &self.buffer).map_or(0, |i| i + 1);
        clean_line(&String::from_utf8_lossy(&self.buffer[start..]))
    }

    /// The last line that has visible content, cleaned.
    pub fn last_non_empty_line(&self) -> Option<String> {
        self.as_str_lossy()
            .split('\n')
            .map(clean_line)
            .rev()
            .find(|l| !l.trim().is_empty())
    }

    /// Take ownership of the buffer contents and reset.
    pub fn take(&mut self) -> Vec<u8> {
        self.pager_scan = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Get a reference to the buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Get the buffer contents as a string (lossy UTF-8 conversion).
    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pager_scan = 0;
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
