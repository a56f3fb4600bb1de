// Re-export modules
pub mod control;
pub mod flight;
pub mod index;
pub mod key;
pub mod store;

pub use control::CacheControl;
pub use flight::{FlightGuard, Flights};
pub use index::{CacheEntry, CacheIndex};
pub use key::{entry_filename, parse_entry_filename, KeyDeriver, KeyPolicy, ShardKey};
pub use store::{now_millis, spawn_sweeper, CacheWriter, DiskCache};
