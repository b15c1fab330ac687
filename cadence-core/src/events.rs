//! Notification bus
//!
//! The engine emits events without knowing who listens. Observers register
//! for a set of event kinds; the cache controller asks whether anybody
//! listens for cache updates before scheduling periodic ones.

use serde::Serialize;

use crate::sync::StreamKind;

/// Snapshot sent with every cache update
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatus {
    pub idle: bool,
    pub underrun: bool,
    pub buffered_duration: f64,
    pub paused_for_cache: bool,
    /// 0..=100, 100 when not buffering
    pub buffering_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    Seek,
    PlaybackRestart,
    /// Fires once per loaded item, on its first restart
    NowPlaying,
    AudioReconfig,
    CacheUpdate(CacheStatus),
    Tick,
    Pause,
    Unpause,
    TrackFailed(StreamKind),
    EndFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Seek,
    PlaybackRestart,
    NowPlaying,
    AudioReconfig,
    CacheUpdate,
    Tick,
    Pause,
    Unpause,
    TrackFailed,
    EndFile,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Seek => EventKind::Seek,
            Event::PlaybackRestart => EventKind::PlaybackRestart,
            Event::NowPlaying => EventKind::NowPlaying,
            Event::AudioReconfig => EventKind::AudioReconfig,
            Event::CacheUpdate(_) => EventKind::CacheUpdate,
            Event::Tick => EventKind::Tick,
            Event::Pause => EventKind::Pause,
            Event::Unpause => EventKind::Unpause,
            Event::TrackFailed(_) => EventKind::TrackFailed,
            Event::EndFile => EventKind::EndFile,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn FnMut(&Event) + Send>;

struct Subscription {
    id: SubscriptionId,
    /// Empty means every kind
    kinds: Vec<EventKind>,
    observer: Observer,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for `kinds` (all kinds when empty)
    pub fn subscribe<F>(&mut self, kinds: &[EventKind], observer: F) -> SubscriptionId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.push(Subscription {
            id,
            kinds: kinds.to_vec(),
            observer: Box::new(observer),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.subscriptions.iter().any(|s| s.wants(kind))
    }

    pub fn emit(&mut self, event: Event) {
        let kind = event.kind();
        tracing::trace!("event {:?}", kind);
        for sub in self.subscriptions.iter_mut().filter(|s| s.wants(kind)) {
            (sub.observer)(&event);
        }
    }
}
