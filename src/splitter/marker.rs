//! Embedded Marker Scanning
//!
//! Single-pass partial-match scan for a literal marker that may sit anywhere
//! in a segment (e.g. `<script>`).
//! - O(1) per byte
//! - Constant memory usage
//! - Exact bytes, no case folding

/// A literal marker to look for inside segment payloads
#[derive(Clone, Copy, Debug)]
pub struct Marker {
    /// Marker name (for logging)
    pub name: &'static str,
    /// Marker bytes
    pub bytes: &'static [u8],
}

impl Marker {
    pub const fn new(name: &'static str, bytes: &'static [u8]) -> Self {
        Self { name, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The script marker that puts the current packet on hold
pub const SCRIPT_MARKER: Marker = Marker::new("script", b"<script>");

/// Partial-match progress against one marker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarkerState {
    /// Leading marker bytes matched so far (0 = not matching)
    position: usize,
}

impl MarkerState {
    pub fn new() -> Self {
        Self { position: 0 }
    }

    /// Advance by one byte, returns true once the whole marker has been seen.
    ///
    /// A byte that breaks a partial match is checked again against the first
    /// marker byte, so `<<script>` still matches. For markers without a
    /// proper border this is the same as a full KMP restart.
    pub fn advance(&mut self, byte: u8, marker: &Marker) -> bool {
        if marker.is_empty() {
            return false;
        }

        if marker.bytes.get(self.position) == Some(&byte) {
            self.position += 1;
        } else if self.position > 0 && marker.bytes[0] == byte {
            self.position = 1;
        } else {
            self.position = 0;
        }

        if self.position == marker.len() {
            self.position = 0;
            return true;
        }
        false
    }

    /// Feed a whole segment, stopping at the first complete match
    pub fn scan(&mut self, data: &[u8], marker: &Marker) -> bool {
        data.iter().any(|&b| self.advance(b, marker))
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

/// Test a single segment for the marker with fresh state
pub fn contains_marker(data: &[u8], marker: &Marker) -> bool {
    MarkerState::new().scan(data, marker)
}
