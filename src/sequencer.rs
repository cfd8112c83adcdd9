use std::{cell::RefCell, collections::HashMap, rc::Rc};

use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    blob::{BlobStore, BlobUrl},
    error::AccessError,
    model::StreamRequestDescriptor,
    source::{AssetSource, TrackBytes},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackSource {
    /// Supplied by the caller; the sequencer never releases it.
    Provided(String),
    /// Created by a prefetch; released exactly once on eviction.
    Blob(BlobUrl),
}

impl TrackSource {
    pub fn as_str(&self) -> &str {
        match self {
            TrackSource::Provided(url) => url,
            TrackSource::Blob(url) => url.as_str(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceState {
    Unfetched,
    Fetching,
    Ready(TrackSource),
    Error(String),
}

impl SourceState {
    pub fn is_settled(&self) -> bool {
        matches!(self, SourceState::Ready(_) | SourceState::Error(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackQueueEntry {
    pub index: usize,
    pub state: SourceState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    /// The position is still being fetched; a later `play` starts it.
    Waiting { index: usize },
    Playing { index: usize, source: TrackSource },
    /// Dismissible; cleared by `dismiss_error`.
    Failed { index: usize, message: String },
}

struct QueueState {
    asset_id: String,
    generation: u64,
    entries: Vec<TrackQueueEntry>,
    current: usize,
    playback: PlaybackState,
}

/// Queue of nested tracks of one asset, prefetched in parallel.
///
/// Must be driven from a `LocalSet`: prefetches are `spawn_local` tasks that
/// write back into the shared queue state.
pub struct PlaybackSequencer {
    state: Rc<RefCell<QueueState>>,
    source: Rc<dyn AssetSource>,
    blobs: Rc<dyn BlobStore>,
    limiter: Rc<Semaphore>,
    cancel: CancellationToken,
    tasks: HashMap<usize, JoinHandle<()>>,
    settled_tx: Rc<watch::Sender<u64>>,
}

fn release(blobs: &dyn BlobStore, state: SourceState) {
    if let SourceState::Ready(TrackSource::Blob(url)) = state {
        if !blobs.revoke(&url) {
            warn!("blob {} was already released", url);
        }
    }
}

/// Writes a prefetch result into its slot, unless the slot moved on.
fn settle(
    state: &RefCell<QueueState>,
    blobs: &dyn BlobStore,
    generation: u64,
    index: usize,
    result: Result<TrackBytes, AccessError>,
) -> bool {
    let mut st = state.borrow_mut();
    if st.generation != generation {
        debug!(index, "discarding prefetch for replaced track list");
        return false;
    }
    let Some(entry) = st.entries.get_mut(index) else {
        return false;
    };
    if entry.state != SourceState::Fetching {
        return false;
    }

    match result {
        Ok(track) => {
            let url = blobs.create(track.bytes, track.content_type);
            debug!(index, %url, "track ready");
            entry.state = SourceState::Ready(TrackSource::Blob(url));
        }
        Err(AccessError::Aborted) => return false,
        Err(err) => {
            warn!(index, "track prefetch failed: {}", err);
            entry.state = SourceState::Error(err.to_string());
        }
    }
    true
}

impl PlaybackSequencer {
    pub fn new(source: Rc<dyn AssetSource>, blobs: Rc<dyn BlobStore>, prefetch_limit: usize) -> Self {
        let (settled_tx, _) = watch::channel(0);
        Self {
            state: Rc::new(RefCell::new(QueueState {
                asset_id: String::new(),
                generation: 0,
                entries: Vec::new(),
                current: 0,
                playback: PlaybackState::Stopped,
            })),
            source,
            blobs,
            limiter: Rc::new(Semaphore::new(prefetch_limit.max(1))),
            cancel: CancellationToken::new(),
            tasks: HashMap::new(),
            settled_tx: Rc::new(settled_tx),
        }
    }

    pub fn blobs(&self) -> &Rc<dyn BlobStore> {
        &self.blobs
    }

    /// Replaces the track list. `provided` is the already available source
    /// of `current`; every other position is prefetched.
    pub fn load(
        &mut self,
        asset_id: &str,
        track_count: usize,
        current: usize,
        provided: Option<String>,
    ) -> Result<(), AccessError> {
        if track_count > 0 && current >= track_count {
            return Err(AccessError::InvalidTrackIndex(current));
        }
        // nested indexes go on the wire as u32
        if u32::try_from(track_count).is_err() {
            return Err(AccessError::InvalidTrackIndex(track_count));
        }
        self.evict_all();
        self.cancel = CancellationToken::new();

        {
            let mut st = self.state.borrow_mut();
            st.asset_id = asset_id.to_string();
            st.current = current;
            st.entries = (0..track_count)
                .map(|index| TrackQueueEntry {
                    index,
                    state: SourceState::Unfetched,
                })
                .collect();
            if let Some(url) = provided {
                if let Some(entry) = st.entries.get_mut(current) {
                    entry.state = SourceState::Ready(TrackSource::Provided(url));
                }
            }
        }
        info!(asset = asset_id, track_count, current, "track list loaded");

        for index in 0..track_count {
            if self.entry_state(index) == Some(SourceState::Unfetched) {
                self.spawn_prefetch(index);
            }
        }
        Ok(())
    }

    fn entry_state(&self, index: usize) -> Option<SourceState> {
        self.state.borrow().entries.get(index).map(|e| e.state.clone())
    }

    fn spawn_prefetch(&mut self, index: usize) {
        let (generation, descriptor) = {
            let mut st = self.state.borrow_mut();
            let Ok(nested) = u32::try_from(index) else {
                st.entries[index].state =
                    SourceState::Error(AccessError::InvalidTrackIndex(index).to_string());
                return;
            };
            let descriptor = StreamRequestDescriptor::track(st.asset_id.clone(), nested);
            st.entries[index].state = SourceState::Fetching;
            (st.generation, descriptor)
        };

        let state = self.state.clone();
        let source = self.source.clone();
        let blobs = self.blobs.clone();
        let limiter = self.limiter.clone();
        let cancel = self.cancel.child_token();
        let settled_tx = self.settled_tx.clone();

        let handle = tokio::task::spawn_local(async move {
            let result: Result<TrackBytes, AccessError> = async {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(AccessError::Aborted),
                    permit = limiter.acquire() => permit.map_err(|_| AccessError::Aborted)?,
                };
                source.fetch_track(&descriptor, &cancel).await
            }
            .await;

            if cancel.is_cancelled() {
                return;
            }
            if settle(&state, &*blobs, generation, index, result) {
                settled_tx.send_modify(|n| *n += 1);
            }
        });

        if let Some(old) = self.tasks.insert(index, handle) {
            old.abort();
        }
    }

    fn evict_all(&mut self) {
        self.cancel.cancel();
        for (_, task) in self.tasks.drain() {
            task.abort();
        }

        let mut st = self.state.borrow_mut();
        st.playback = PlaybackState::Stopped;
        st.generation += 1;
        let evicted = std::mem::take(&mut st.entries);
        drop(st);

        for entry in evicted {
            release(&*self.blobs, entry.state);
        }
    }

    /// Drops the track list, cancelling prefetches and releasing blobs.
    pub fn clear(&mut self) {
        self.evict_all();
        let mut st = self.state.borrow_mut();
        st.asset_id.clear();
        st.current = 0;
    }

    fn start_current(&mut self) -> PlaybackState {
        let current = self.state.borrow().current;
        if self.entry_state(current) == Some(SourceState::Unfetched) {
            self.spawn_prefetch(current);
        }

        let mut st = self.state.borrow_mut();
        let Some(entry) = st.entries.get(current) else {
            st.playback = PlaybackState::Stopped;
            return PlaybackState::Stopped;
        };
        let next = match &entry.state {
            SourceState::Ready(source) => PlaybackState::Playing {
                index: current,
                source: source.clone(),
            },
            SourceState::Unfetched | SourceState::Fetching => {
                PlaybackState::Waiting { index: current }
            }
            SourceState::Error(message) => PlaybackState::Failed {
                index: current,
                message: message.clone(),
            },
        };
        match &next {
            PlaybackState::Playing { index, .. } => info!(index, "playing"),
            PlaybackState::Waiting { index } => info!(index, "waiting for track"),
            PlaybackState::Failed { index, message } => warn!(index, "track unavailable: {}", message),
            PlaybackState::Stopped => {}
        }
        st.playback = next.clone();
        next
    }

    /// "Track finished": advance, wrapping to 0.
    pub fn track_finished(&mut self) -> PlaybackState {
        {
            let mut st = self.state.borrow_mut();
            if st.entries.is_empty() {
                st.playback = PlaybackState::Stopped;
                return PlaybackState::Stopped;
            }
            st.current = (st.current + 1) % st.entries.len();
        }
        self.start_current()
    }

    pub fn select(&mut self, index: usize) -> Result<PlaybackState, AccessError> {
        if index >= self.len() {
            return Err(AccessError::InvalidTrackIndex(index));
        }
        {
            let mut st = self.state.borrow_mut();
            st.playback = PlaybackState::Stopped;
            st.current = index;
        }
        Ok(self.start_current())
    }

    /// User play action on the current position.
    pub fn play(&mut self) -> PlaybackState {
        let playback = self.playback();
        if let PlaybackState::Playing { .. } = playback {
            return playback;
        }
        self.start_current()
    }

    pub fn stop(&mut self) {
        self.state.borrow_mut().playback = PlaybackState::Stopped;
    }

    pub fn dismiss_error(&mut self) {
        let mut st = self.state.borrow_mut();
        if let PlaybackState::Failed { .. } = st.playback {
            st.playback = PlaybackState::Stopped;
        }
    }

    /// Fetches one slot again. The playing slot is never overwritten.
    pub fn refetch(&mut self, index: usize) -> Result<(), AccessError> {
        let old = {
            let mut st = self.state.borrow_mut();
            if let PlaybackState::Playing { index: playing, .. } = st.playback {
                if playing == index {
                    return Err(AccessError::SlotInUse(index));
                }
            }
            let entry = st
                .entries
                .get_mut(index)
                .ok_or(AccessError::InvalidTrackIndex(index))?;
            std::mem::replace(&mut entry.state, SourceState::Unfetched)
        };
        if let Some(task) = self.tasks.remove(&index) {
            task.abort();
        }
        release(&*self.blobs, old);
        self.spawn_prefetch(index);
        Ok(())
    }

    /// Resolves once the entry at `index` is ready or failed.
    pub async fn wait_settled(&self, index: usize) -> Result<SourceState, AccessError> {
        let mut rx = self.settled_tx.subscribe();
        loop {
            match self.entry_state(index) {
                None => return Err(AccessError::InvalidTrackIndex(index)),
                Some(state) if state.is_settled() => return Ok(state),
                Some(_) => {}
            }
            if rx.changed().await.is_err() {
                return Err(AccessError::Aborted);
            }
        }
    }

    pub fn playback(&self) -> PlaybackState {
        self.state.borrow().playback.clone()
    }

    pub fn current(&self) -> usize {
        self.state.borrow().current
    }

    pub fn asset_id(&self) -> String {
        self.state.borrow().asset_id.clone()
    }

    pub fn entry(&self, index: usize) -> Option<TrackQueueEntry> {
        self.state.borrow().entries.get(index).cloned()
    }

    pub fn entries(&self) -> Vec<TrackQueueEntry> {
        self.state.borrow().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries marked `Fetching`, including those still queued for a permit.
    pub fn fetching(&self) -> usize {
        self.state
            .borrow()
            .entries
            .iter()
            .filter(|e| e.state == SourceState::Fetching)
            .count()
    }
}

impl Drop for PlaybackSequencer {
    fn drop(&mut self) {
        self.evict_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        future::Future,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Notify;

    use super::*;
    use crate::blob::{Blob, MemoryBlobStore};

    #[derive(Default)]
    struct ScriptedSource {
        calls: RefCell<Vec<(String, u32)>>,
        gates: RefCell<HashMap<u32, Rc<Notify>>>,
        failures: RefCell<HashMap<u32, AccessError>>,
        in_flight: Cell<usize>,
        max_in_flight: Cell<usize>,
    }

    impl ScriptedSource {
        fn gate(&self, index: u32) -> Rc<Notify> {
            self.gates
                .borrow_mut()
                .entry(index)
                .or_insert_with(|| Rc::new(Notify::new()))
                .clone()
        }

        fn fail(&self, index: u32, err: AccessError) {
            self.failures.borrow_mut().insert(index, err);
        }

        fn fetched_indexes(&self) -> Vec<u32> {
            let mut idx: Vec<u32> = self.calls.borrow().iter().map(|(_, i)| *i).collect();
            idx.sort_unstable();
            idx
        }
    }

    #[async_trait(?Send)]
    impl AssetSource for ScriptedSource {
        async fn fetch_track(
            &self,
            descriptor: &StreamRequestDescriptor,
            cancel: &CancellationToken,
        ) -> Result<TrackBytes, AccessError> {
            let index = descriptor.nested_index.expect("track descriptor");
            self.calls
                .borrow_mut()
                .push((descriptor.asset_id.clone(), index));
            self.in_flight.set(self.in_flight.get() + 1);
            self.max_in_flight
                .set(self.max_in_flight.get().max(self.in_flight.get()));

            let gate = self.gates.borrow().get(&index).cloned();
            match gate {
                Some(gate) => tokio::select! {
                    _ = cancel.cancelled() => return Err(AccessError::Aborted),
                    _ = gate.notified() => {}
                },
                None => tokio::task::yield_now().await,
            }
            self.in_flight.set(self.in_flight.get() - 1);

            if let Some(err) = self.failures.borrow().get(&index) {
                return Err(err.clone());
            }
            Ok(TrackBytes {
                bytes: Bytes::from(format!("{}/{}", descriptor.asset_id, index)),
                content_type: Some("audio/mpeg".into()),
            })
        }
    }

    /// Counts revokes per url.
    #[derive(Default)]
    struct TrackingBlobs {
        inner: MemoryBlobStore,
        created: RefCell<Vec<BlobUrl>>,
        revokes: RefCell<HashMap<BlobUrl, u32>>,
    }

    impl TrackingBlobs {
        fn revokes_of(&self, url: &BlobUrl) -> u32 {
            self.revokes.borrow().get(url).copied().unwrap_or(0)
        }
    }

    impl BlobStore for TrackingBlobs {
        fn create(&self, bytes: Bytes, content_type: Option<String>) -> BlobUrl {
            let url = self.inner.create(bytes, content_type);
            self.created.borrow_mut().push(url.clone());
            url
        }

        fn get(&self, url: &BlobUrl) -> Option<Blob> {
            self.inner.get(url)
        }

        fn revoke(&self, url: &BlobUrl) -> bool {
            *self.revokes.borrow_mut().entry(url.clone()).or_default() += 1;
            self.inner.revoke(url)
        }
    }

    struct Fixture {
        source: Rc<ScriptedSource>,
        blobs: Rc<TrackingBlobs>,
        seq: PlaybackSequencer,
    }

    fn fixture(limit: usize) -> Fixture {
        let source = Rc::new(ScriptedSource::default());
        let blobs = Rc::new(TrackingBlobs::default());
        let seq = PlaybackSequencer::new(source.clone(), blobs.clone(), limit);
        Fixture { source, blobs, seq }
    }

    async fn local<F: Future>(f: F) -> F::Output {
        tokio::task::LocalSet::new().run_until(f).await
    }

    async fn settle_all(seq: &PlaybackSequencer) {
        for index in 0..seq.len() {
            seq.wait_settled(index).await.unwrap();
        }
    }

    fn blob_url(seq: &PlaybackSequencer, index: usize) -> BlobUrl {
        match seq.entry(index).unwrap().state {
            SourceState::Ready(TrackSource::Blob(url)) => url,
            other => panic!("track {} not a ready blob: {:?}", index, other),
        }
    }

    #[tokio::test]
    async fn prefetches_every_position_but_current() {
        local(async {
            let mut f = fixture(16);
            f.seq.load("album", 5, 2, Some("https://cdn/track-2".into())).unwrap();
            assert_eq!(f.seq.fetching(), 4);

            settle_all(&f.seq).await;
            assert_eq!(f.source.fetched_indexes(), vec![0, 1, 3, 4]);
            assert_eq!(
                f.seq.entry(2).unwrap().state,
                SourceState::Ready(TrackSource::Provided("https://cdn/track-2".into()))
            );
            let url = blob_url(&f.seq, 4);
            assert_eq!(&f.blobs.get(&url).unwrap().bytes[..], b"album/4");
        })
        .await;
    }

    #[tokio::test]
    async fn without_provided_source_current_is_fetched_too() {
        local(async {
            let mut f = fixture(16);
            f.seq.load("album", 3, 0, None).unwrap();
            settle_all(&f.seq).await;
            assert_eq!(f.source.fetched_indexes(), vec![0, 1, 2]);
        })
        .await;
    }

    #[tokio::test]
    async fn finished_while_next_is_fetching_waits() {
        local(async {
            let mut f = fixture(16);
            let gate = f.source.gate(1);
            f.seq.load("album", 3, 0, Some("provided".into())).unwrap();
            assert!(matches!(f.seq.play(), PlaybackState::Playing { index: 0, .. }));

            f.seq.wait_settled(2).await.unwrap();
            assert_eq!(f.seq.track_finished(), PlaybackState::Waiting { index: 1 });
            assert_eq!(f.seq.play(), PlaybackState::Waiting { index: 1 });

            gate.notify_one();
            f.seq.wait_settled(1).await.unwrap();
            let url = blob_url(&f.seq, 1);
            assert_eq!(
                f.seq.play(),
                PlaybackState::Playing {
                    index: 1,
                    source: TrackSource::Blob(url)
                }
            );
        })
        .await;
    }

    #[tokio::test]
    async fn advance_wraps_to_start() {
        local(async {
            let mut f = fixture(16);
            f.seq.load("album", 2, 1, Some("provided".into())).unwrap();
            settle_all(&f.seq).await;
            assert!(matches!(
                f.seq.track_finished(),
                PlaybackState::Playing { index: 0, .. }
            ));
            assert!(matches!(
                f.seq.track_finished(),
                PlaybackState::Playing { index: 1, source: TrackSource::Provided(_) }
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn eviction_releases_each_blob_once() {
        local(async {
            let mut f = fixture(16);
            f.seq.load("first", 3, 0, Some("provided".into())).unwrap();
            settle_all(&f.seq).await;
            let first: Vec<BlobUrl> = vec![blob_url(&f.seq, 1), blob_url(&f.seq, 2)];

            f.seq.load("second", 2, 0, Some("provided".into())).unwrap();
            for url in &first {
                assert_eq!(f.blobs.revokes_of(url), 1);
            }
            settle_all(&f.seq).await;
            let second = blob_url(&f.seq, 1);
            assert_eq!(f.blobs.revokes_of(&second), 0);

            drop(f.seq);
            assert_eq!(f.blobs.revokes_of(&second), 1);
            assert_eq!(f.blobs.created.borrow().len(), 3);
            assert_eq!(f.blobs.revokes.borrow().values().sum::<u32>(), 3);
            assert_eq!(f.blobs.inner.live(), 0);
        })
        .await;
    }

    #[tokio::test]
    async fn replaced_list_discards_pending_results() {
        local(async {
            let mut f = fixture(16);
            let gate = f.source.gate(1);
            f.seq.load("a", 2, 0, Some("provided".into())).unwrap();
            tokio::task::yield_now().await;

            f.seq.load("b", 2, 0, Some("provided".into())).unwrap();
            tokio::task::yield_now().await;
            gate.notify_one();
            f.seq.wait_settled(1).await.unwrap();

            let url = blob_url(&f.seq, 1);
            assert_eq!(&f.blobs.get(&url).unwrap().bytes[..], b"b/1");
            assert_eq!(f.blobs.created.borrow().len(), 1);
        })
        .await;
    }

    #[test]
    fn stale_generation_is_not_written() {
        let blobs = MemoryBlobStore::new();
        let state = RefCell::new(QueueState {
            asset_id: "a".into(),
            generation: 4,
            entries: vec![TrackQueueEntry {
                index: 0,
                state: SourceState::Fetching,
            }],
            current: 0,
            playback: PlaybackState::Stopped,
        });
        let track = || {
            Ok(TrackBytes {
                bytes: Bytes::from_static(b"x"),
                content_type: None,
            })
        };

        assert!(!settle(&state, &blobs, 3, 0, track()));
        assert_eq!(blobs.live(), 0);
        assert!(settle(&state, &blobs, 4, 0, track()));
        assert_eq!(blobs.live(), 1);
        // already ready, a duplicate result is dropped
        assert!(!settle(&state, &blobs, 4, 0, track()));
        assert_eq!(blobs.live(), 1);
    }

    #[tokio::test]
    async fn failed_track_is_reported_when_selected() {
        local(async {
            let mut f = fixture(16);
            f.source
                .fail(2, AccessError::AssetAccessDenied("Forbidden".into()));
            f.seq.load("album", 4, 0, Some("provided".into())).unwrap();
            settle_all(&f.seq).await;

            assert!(matches!(f.seq.entry(1).unwrap().state, SourceState::Ready(_)));
            assert!(matches!(f.seq.entry(3).unwrap().state, SourceState::Ready(_)));

            match f.seq.select(2).unwrap() {
                PlaybackState::Failed { index, message } => {
                    assert_eq!(index, 2);
                    assert!(message.contains("Forbidden"));
                }
                other => panic!("expected failure, got {:?}", other),
            }
            f.seq.dismiss_error();
            assert_eq!(f.seq.playback(), PlaybackState::Stopped);

            assert!(matches!(
                f.seq.select(3).unwrap(),
                PlaybackState::Playing { index: 3, .. }
            ));
            assert_eq!(f.seq.select(9), Err(AccessError::InvalidTrackIndex(9)));
        })
        .await;
    }

    #[cfg(target_pointer_width = "64")]
    #[tokio::test]
    async fn oversized_list_is_rejected() {
        local(async {
            let mut f = fixture(4);
            f.seq.load("album", 3, 0, Some("provided".into())).unwrap();

            let too_many = u32::MAX as usize + 1;
            assert_eq!(
                f.seq.load("huge", too_many, 0, None),
                Err(AccessError::InvalidTrackIndex(too_many))
            );
            assert_eq!(f.seq.asset_id(), "album");
            assert_eq!(f.seq.len(), 3);
        })
        .await;
    }

    #[tokio::test]
    async fn prefetch_respects_limit() {
        local(async {
            let mut f = fixture(2);
            f.seq.load("album", 7, 0, Some("provided".into())).unwrap();
            settle_all(&f.seq).await;
            assert_eq!(f.source.calls.borrow().len(), 6);
            assert!(f.source.max_in_flight.get() <= 2);
        })
        .await;
    }

    #[tokio::test]
    async fn refetch_never_touches_playing_slot() {
        local(async {
            let mut f = fixture(16);
            f.seq.load("album", 3, 0, Some("provided".into())).unwrap();
            settle_all(&f.seq).await;
            f.seq.play();
            assert_eq!(f.seq.refetch(0), Err(AccessError::SlotInUse(0)));

            let old = blob_url(&f.seq, 1);
            f.seq.refetch(1).unwrap();
            assert_eq!(f.blobs.revokes_of(&old), 1);
            f.seq.wait_settled(1).await.unwrap();
            assert_ne!(blob_url(&f.seq, 1), old);
            assert_eq!(f.source.calls.borrow().len(), 3);
        })
        .await;
    }

    #[tokio::test]
    async fn clear_cancels_pending_prefetches() {
        local(async {
            let mut f = fixture(16);
            let _gate = f.source.gate(1);
            f.seq.load("album", 2, 0, Some("provided".into())).unwrap();
            tokio::task::yield_now().await;

            f.seq.clear();
            assert!(f.seq.is_empty());
            assert_eq!(f.seq.track_finished(), PlaybackState::Stopped);
            assert_eq!(f.blobs.created.borrow().len(), 0);
        })
        .await;
    }
}
