//! Extension fan-out.
//!
//! Auxiliary modules subscribe to per-channel sample and metering callbacks:
//! pre-filter IQ, post-filter real samples, FFT output, and S-meter
//! readings. Dispatch snapshots the callback list before iterating, so
//! registering or unregistering from inside a callback is safe while the
//! channel is mid-processing.

use crate::wf::ChannelId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use rustfft::num_complex::Complex32;
use std::fmt;
use std::sync::Arc;

/// Which sample stream a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleCategory {
    /// IQ samples ahead of the FIR filter.
    PreFilterIq,
    /// Real samples after filtering, detection, and AGC.
    PostFilterReal,
    /// Complex FFT output of the waterfall transform.
    Fft,
    /// Signal-strength metering in dBm.
    SMeter,
}

/// Payload handed to subscribers.
#[derive(Debug, Clone, Copy)]
pub enum ExtPayload<'a> {
    Iq(&'a [Complex32]),
    Real(&'a [f32]),
    Fft(&'a [Complex32]),
    SMeterDbm(f32),
}

/// One dispatched event.
#[derive(Debug, Clone, Copy)]
pub struct ExtEvent<'a> {
    pub channel: ChannelId,
    pub category: SampleCategory,
    pub payload: ExtPayload<'a>,
}

pub type ExtCallback = Arc<dyn Fn(&ExtEvent<'_>) + Send + Sync>;

/// Handle returned by [`ExtRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subs: FxHashMap<(ChannelId, SampleCategory), Vec<(SubscriptionId, ExtCallback)>>,
}

/// Observer list keyed by channel id and sample category.
#[derive(Default)]
pub struct ExtRegistry {
    inner: RwLock<RegistryInner>,
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        channel: ChannelId,
        category: SampleCategory,
        callback: ExtCallback,
    ) -> SubscriptionId {
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner
            .subs
            .entry((channel, category))
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove a subscription. Unknown ids are ignored: a double unregister
    /// from a disconnecting extension is not an error.
    pub fn unregister(&self, id: SubscriptionId) {
        let mut inner = self.inner.write();
        for list in inner.subs.values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    pub fn subscriber_count(&self, channel: ChannelId, category: SampleCategory) -> usize {
        self.inner
            .read()
            .subs
            .get(&(channel, category))
            .map_or(0, Vec::len)
    }

    /// Deliver an event to every subscriber of its (channel, category) key.
    /// The list is snapshotted under the read lock and iterated without it.
    pub fn dispatch(&self, event: &ExtEvent<'_>) {
        let snapshot: Vec<ExtCallback> = {
            let inner = self.inner.read();
            match inner.subs.get(&(event.channel, event.category)) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        for callback in snapshot {
            callback(event);
        }
    }
}

impl fmt::Debug for ExtRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ExtRegistry")
            .field("subscriptions", &inner.subs.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_callback(counter: Arc<AtomicUsize>) -> ExtCallback {
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispatch_reaches_matching_subscribers_only() {
        let registry = ExtRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(
            ChannelId::new(0),
            SampleCategory::SMeter,
            counter_callback(Arc::clone(&hits)),
        );

        registry.dispatch(&ExtEvent {
            channel: ChannelId::new(0),
            category: SampleCategory::SMeter,
            payload: ExtPayload::SMeterDbm(-73.0),
        });
        registry.dispatch(&ExtEvent {
            channel: ChannelId::new(1),
            category: SampleCategory::SMeter,
            payload: ExtPayload::SMeterDbm(-73.0),
        });
        registry.dispatch(&ExtEvent {
            channel: ChannelId::new(0),
            category: SampleCategory::Fft,
            payload: ExtPayload::Fft(&[]),
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_stops_delivery_and_tolerates_repeats() {
        let registry = ExtRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = registry.register(
            ChannelId::new(2),
            SampleCategory::PostFilterReal,
            counter_callback(Arc::clone(&hits)),
        );
        assert_eq!(registry.subscriber_count(ChannelId::new(2), SampleCategory::PostFilterReal), 1);

        registry.unregister(id);
        registry.unregister(id);
        registry.dispatch(&ExtEvent {
            channel: ChannelId::new(2),
            category: SampleCategory::PostFilterReal,
            payload: ExtPayload::Real(&[0.0]),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registering_during_dispatch_does_not_deadlock() {
        let registry = Arc::new(ExtRegistry::new());
        let inner_registry = Arc::clone(&registry);
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_hits = Arc::clone(&hits);

        registry.register(
            ChannelId::new(0),
            SampleCategory::PreFilterIq,
            Arc::new(move |_event| {
                // Mid-dispatch registration: must neither deadlock nor be
                // visible to the in-flight snapshot.
                inner_registry.register(
                    ChannelId::new(0),
                    SampleCategory::PreFilterIq,
                    counter_callback(Arc::clone(&inner_hits)),
                );
            }),
        );

        registry.dispatch(&ExtEvent {
            channel: ChannelId::new(0),
            category: SampleCategory::PreFilterIq,
            payload: ExtPayload::Iq(&[]),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subscriber_count(ChannelId::new(0), SampleCategory::PreFilterIq), 2);
    }
}
