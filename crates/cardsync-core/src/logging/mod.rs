//! Per-peer JSONL logging.
//!
//! Two peers are often run side by side on one machine while testing a
//! handshake. Each writes its own file, so their logs never interleave:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-19_offer.jsonl
//!     └── 2026-10-19_answer.jsonl
//! ```
//!
//! ```ignore
//! use cardsync_core::logging::LoggingBuilder;
//!
//! let path = LoggingBuilder::new("./logs", "offer")
//!     .with_filter("cardsync_core=trace")
//!     .init()?;
//! ```
//!
//! Query with jq:
//!
//! ```bash
//! # Every protocol warning from both peers, in time order
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.level == "warn")'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogLine;
pub use layer::{JsonlLayer, LoggingBuilder, DEFAULT_FILTER};
pub use writer::{read_all_lines, PeerLogWriter};
