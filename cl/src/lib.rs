//! ConvLog - append-only per-chat conversation logs
//!
//! Stores one plain-text log file per chat so that the control plane (and the
//! external reasoning service it consults) can read back the recent
//! conversation without holding anything in memory.
//!
//! # Architecture
//!
//! ```text
//! .convlog/
//! ├── 1001.log       # one file per chat id
//! ├── 1002.log
//! └── ...
//! ```
//!
//! # Example
//!
//! ```ignore
//! use convlog::ConvLog;
//!
//! let log = ConvLog::open(".convlog")?;
//! log.append(1001, "user", "We need retry on payment failures")?;
//! let tail = log.tail(1001, 16 * 1024)?;
//! ```

mod log;

pub use log::ConvLog;

/// Default byte budget for tail reads (16KB)
pub const DEFAULT_TAIL_BUDGET: usize = 16 * 1024;
