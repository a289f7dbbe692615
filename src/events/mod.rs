//! # Events Module
//!
//! Activity reporting for the cache.
//!
//! ## Design
//! The coordinator emits events through channels, so a CLI, an audit log or
//! a test can subscribe without the core depending on any of them.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//!
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         match event {
//!             Event::Ingest(IngestEvent::Decided(d)) => println!("{} {}", d.content_digest, d.outcome),
//!             Event::Eviction(EvictionEvent::Evicted { digest, .. }) => println!("evicted {}", digest),
//!             _ => {}
//!         }
//!     }
//! });
//!
//! let cache = CacheCoordinator::builder(config).events(sender).open()?;
//! ```

mod channel;
mod types;

pub use channel::{null_sender, EventChannel, EventReceiver, EventSender};
pub use types::*;
