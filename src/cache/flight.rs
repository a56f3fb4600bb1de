use super::key::ShardKey;
use crate::config::SupportedFormat;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type FlightKey = (ShardKey, SupportedFormat);

/// Per (shard, format) transcode tokens.
///
/// Only the holder of a token may create a cache file for that target;
/// everyone else queues behind it and re-checks the index once it is released.
#[derive(Debug, Default)]
pub struct Flights {
    slots: Mutex<HashMap<FlightKey, Weak<AsyncMutex<()>>>>,
}

/// Held for the whole transcode; released on drop.
#[derive(Debug)]
pub struct FlightGuard {
    _token: OwnedMutexGuard<()>,
}

impl Flights {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, shard: &ShardKey, format: SupportedFormat) -> FlightGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| slot.strong_count() > 0);
            let key = (shard.clone(), format);
            match slots.get(&key).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(AsyncMutex::new(()));
                    slots.insert(key, Arc::downgrade(&slot));
                    slot
                }
            }
        };
        FlightGuard { _token: slot.lock_owned().await }
    }

    /// Targets currently being transcoded or waited on.
    pub fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_target_is_serialized() {
        let flights = Arc::new(Flights::new());
        let shard = ShardKey::digest("a");

        let first = flights.acquire(&shard, SupportedFormat::Webp).await;
        let waiter = {
            let flights = flights.clone();
            let shard = shard.clone();
            tokio::spawn(async move { flights.acquire(&shard, SupportedFormat::Webp).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        drop(second);
        assert_eq!(flights.active(), 0);
    }

    #[tokio::test]
    async fn other_formats_do_not_block() {
        let flights = Flights::new();
        let shard = ShardKey::digest("a");

        let _webp = flights.acquire(&shard, SupportedFormat::Webp).await;
        let avif = tokio::time::timeout(
            Duration::from_millis(100),
            flights.acquire(&shard, SupportedFormat::Avif),
        )
        .await;
        assert!(avif.is_ok());
    }
}
