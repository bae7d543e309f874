//! Media frame vocabulary: timestamps, the fragmentation constant, and
//! reassembly.
//!
//! A frame (one encoded picture) travels as `ceil(len / MTU)` fragments
//! that all carry the frame's [`FrameTimestamp`]; the receiving side
//! rebuilds the frame in [`reassembly`] regardless of arrival order.

pub mod reassembly;

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::OnceLock;

use minstant::{Anchor, Instant};

/// Fragment payload size: Ethernet-scale MTU. The last fragment of a
/// frame may be shorter.
pub const MTU: usize = 1500;

/// Wall-clock capture time of a frame, in microseconds since the UNIX
/// epoch.
///
/// The timestamp is the reassembly key: every fragment of a frame
/// carries the same value, and this layer treats it as opaque beyond
/// equality. On the wire it travels as its decimal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameTimestamp(u64);

fn anchor() -> &'static Anchor {
    static ANCHOR: OnceLock<Anchor> = OnceLock::new();
    ANCHOR.get_or_init(Anchor::new)
}

impl FrameTimestamp {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Instant::now().as_unix_nanos(anchor()) / 1_000)
    }

    /// Builds a timestamp from raw microseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Microseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FrameTimestamp {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}
