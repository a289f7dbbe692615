//! # receipt-cache CLI
//!
//! Command-line interface for the receipt image cache.
//!
//! ## Usage
//! ```bash
//! receipt-cache ingest scans/*.jpg --origin drive:march
//! receipt-cache stats --output json
//! receipt-cache get 3a7bd3e2... --out receipt.jpg
//! ```

mod cli;

use receipt_cache::Result;

fn main() -> Result<()> {
    cli::run()
}
