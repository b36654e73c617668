//! Stream: the per-quality state machine (§4.4). This is the engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::warn;

use crate::chunk::{Chunk, WakeSignal};
use crate::collaborators::ArgvBuilder;
use crate::config::EngineConfig;
use crate::encoder::{EncoderEvent, EncoderProcess};
use crate::error::EngineError;
use crate::store::SegmentStore;

struct StreamState {
    chunks: HashMap<u64, Chunk>,
    goal: u64,
    encoder: Option<EncoderProcess>,
    /// Bumped on every restart; the identity token waiters compare against
    /// on wake (§9, Epoch identification).
    epoch: u64,
    inactive: u64,
}

struct StreamInner {
    quality: String,
    store: SegmentStore,
    config: EngineConfig,
    binary_path: String,
    argv_builder: Arc<dyn ArgvBuilder>,
    state: Mutex<StreamState>,
    next_waiter_id: AtomicU64,
    stop: Notify,
}

/// Cheaply cloneable handle to a Stream; every clone refers to the same
/// state machine.
#[derive(Clone)]
pub struct Stream(Arc<StreamInner>);

impl Stream {
    pub fn new(
        quality: String,
        store: SegmentStore,
        config: EngineConfig,
        binary_path: String,
        argv_builder: Arc<dyn ArgvBuilder>,
    ) -> Self {
        Self(Arc::new(StreamInner {
            quality,
            store,
            config,
            binary_path,
            argv_builder,
            state: Mutex::new(StreamState {
                chunks: HashMap::new(),
                goal: 0,
                encoder: None,
                epoch: 0,
                inactive: 0,
            }),
            next_waiter_id: AtomicU64::new(0),
            stop: Notify::new(),
        }))
    }

    pub fn quality(&self) -> &str {
        &self.0.quality
    }

    fn next_waiter_id(&self) -> u64 {
        self.0.next_waiter_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the owned Run() task (§4.4.1). Call once, right after
    /// construction.
    pub fn spawn_run_loop(&self) {
        let stream = self.clone();
        let idle_ticks_threshold = ticks_for(
            stream.0.config.idle_timeout,
            stream.0.config.tick_interval,
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stream.0.config.tick_interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stream.0.stop.notified() => break,
                }
                stream.tick(idle_ticks_threshold).await;
            }
        });
    }

    /// Non-blocking, idempotent (R2): subsequent calls after the Run loop
    /// has already stopped are no-ops.
    pub fn stop(&self) {
        self.0.stop.notify_one();
    }

    async fn tick(&self, idle_ticks_threshold: u64) {
        let mut state = self.0.state.lock().await;

        let prune_below = state.goal.saturating_sub(self.0.config.clamped_goal_max());
        let stale: Vec<u64> = state
            .chunks
            .keys()
            .copied()
            .filter(|id| *id < prune_below)
            .collect();
        for id in stale {
            state.chunks.remove(&id);
            self.0.store.remove_chunk(&self.0.quality, id);
        }

        state.inactive += 1;
        if state.inactive >= idle_ticks_threshold && state.encoder.is_some() {
            self.teardown_locked(&mut state).await;
        }
    }

    async fn teardown_locked(&self, state: &mut StreamState) {
        if let Some(encoder) = state.encoder.take() {
            encoder.kill().await;
        }
        for (_, mut chunk) in state.chunks.drain() {
            chunk.wake_conflict();
        }
        state.goal = 0;
    }

    /// True if the Stream has no live encoder right now. Used by the
    /// Supervisor's own idle loop.
    pub async fn is_idle(&self) -> bool {
        self.0.state.lock().await.encoder.is_none()
    }

    /// `ServeChunk(id)` (§4.4.1): picks one of the four branches.
    pub async fn serve_chunk(&self, id: u64) -> Result<PathBuf, EngineError> {
        enum Action {
            Ready,
            Wait(oneshot::Receiver<WakeSignal>, u64),
            Restart,
        }

        let action = {
            let mut state = self.0.state.lock().await;
            state.inactive = 0;
            self.advance_goal_locked(&mut state, id);

            if state.chunks.get(&id).is_some_and(|c| c.done) {
                Action::Ready
            } else if state.chunks.contains_key(&id) {
                let waiter_id = self.next_waiter_id();
                let rx = state.chunks.get_mut(&id).unwrap().add_waiter(waiter_id);
                Action::Wait(rx, waiter_id)
            } else if state.encoder.is_some() && self.near_hit_locked(&state, id) {
                let waiter_id = self.next_waiter_id();
                let rx = state
                    .chunks
                    .entry(id)
                    .or_insert_with(Chunk::new)
                    .add_waiter(waiter_id);
                Action::Wait(rx, waiter_id)
            } else {
                Action::Restart
            }
        };

        match action {
            Action::Ready => self.read_ready(id),
            Action::Wait(rx, waiter_id) => self.wait_for(rx, id, waiter_id).await,
            Action::Restart => self.restart_and_wait(id).await,
        }
    }

    fn near_hit_locked(&self, state: &StreamState, id: u64) -> bool {
        let lower = id.saturating_sub(self.0.config.look_behind);
        (lower..id).any(|candidate| state.chunks.contains_key(&candidate))
    }

    /// §4.4.4: grow the goal window and wake a paused encoder.
    fn advance_goal_locked(&self, state: &mut StreamState, id: u64) {
        if id + self.0.config.goal_min > state.goal {
            state.goal = id + self.0.config.clamped_goal_max();
            if let Some(encoder) = &state.encoder {
                encoder.resume();
            }
        }
    }

    fn read_ready(&self, id: u64) -> Result<PathBuf, EngineError> {
        self.0
            .store
            .path_for_chunk(&self.0.quality, id)
            .ok_or_else(|| {
                EngineError::StoreIoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "segment marked done but file missing",
                ))
            })
    }

    async fn wait_for(
        &self,
        rx: oneshot::Receiver<WakeSignal>,
        id: u64,
        waiter_id: u64,
    ) -> Result<PathBuf, EngineError> {
        match tokio::time::timeout(self.0.config.wait_timeout, rx).await {
            Ok(Ok(WakeSignal::Done)) => self.read_ready(id),
            Ok(Ok(WakeSignal::Conflict)) | Ok(Err(_)) => {
                Err(EngineError::TransientProducerFailure { id })
            }
            Err(_elapsed) => {
                let mut state = self.0.state.lock().await;
                if let Some(chunk) = state.chunks.get_mut(&id) {
                    chunk.remove_waiter(waiter_id);
                }
                Err(EngineError::WaitTimeout { id })
            }
        }
    }

    /// Branch 4 (Miss): kill the current encoder, clear the table, and
    /// start a fresh one at `id` (§4.4.1, §4.4.3).
    async fn restart_and_wait(&self, id: u64) -> Result<PathBuf, EngineError> {
        let mut state = self.0.state.lock().await;

        if let Some(old) = state.encoder.take() {
            old.kill().await;
        }
        for (_, mut chunk) in state.chunks.drain() {
            chunk.wake_conflict();
        }

        state.epoch += 1;
        let epoch = state.epoch;
        state.goal = id + self.0.config.clamped_goal_max();

        let start_second = self.start_second_for(id);
        let pattern = self.segment_output_pattern();
        let args = self.0.argv_builder.build_args(start_second, &pattern, true);

        let (tx, rx_events) = mpsc::channel(32);
        let handle = match EncoderProcess::launch(
            &self.0.binary_path,
            args,
            self.0.quality.clone(),
            id,
            epoch,
            tx,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(quality = %self.0.quality, %err, "failed to launch encoder");
                return Err(err);
            }
        };
        state.encoder = Some(handle);

        let waiter_id = self.next_waiter_id();
        let rx = state
            .chunks
            .entry(id)
            .or_insert_with(Chunk::new)
            .add_waiter(waiter_id);

        drop(state);

        tokio::spawn(run_encoder_events(self.clone(), epoch, rx_events));

        self.wait_for(rx, id, waiter_id).await
    }

    /// Keyframe-aligned seek position for a fresh encoder start (§3,
    /// EncoderProcess.startId; §9 Open question — clamped to 0 at id=0).
    fn start_second_for(&self, id: u64) -> f64 {
        if id == 0 {
            0.0
        } else {
            ((id - 1) * self.0.config.segment_duration_secs) as f64
        }
    }

    fn segment_output_pattern(&self) -> String {
        self.0
            .store
            .root()
            .join(format!("{}-%06d.ts", self.0.quality))
            .to_string_lossy()
            .into_owned()
    }

    async fn on_segment_ready(&self, epoch: u64, id: u64) {
        let mut state = self.0.state.lock().await;
        if state.epoch != epoch {
            return; // stale announcement from a replaced encoder
        }
        state.chunks.entry(id).or_insert_with(Chunk::new).mark_done();
        if id >= state.goal
            && let Some(encoder) = &state.encoder
        {
            encoder.pause();
        }
    }

    async fn on_encoder_exited(&self, epoch: u64, code: Option<i32>) {
        let mut state = self.0.state.lock().await;
        if state.epoch != epoch {
            return; // already replaced; this report is stale
        }
        if code != Some(0) {
            warn!(quality = %self.0.quality, ?code, "encoder exited, waking waiters with conflict");
        }
        for (_, mut chunk) in state.chunks.drain() {
            chunk.wake_conflict();
        }
        state.encoder = None;
        state.goal = 0;
    }
}

async fn run_encoder_events(stream: Stream, epoch: u64, mut rx: mpsc::Receiver<EncoderEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            EncoderEvent::SegmentReady(id) => stream.on_segment_ready(epoch, id).await,
            EncoderEvent::Exited(code) => {
                stream.on_encoder_exited(epoch, code).await;
                break;
            }
        }
    }
}

fn ticks_for(duration: std::time::Duration, tick: std::time::Duration) -> u64 {
    let tick_secs = tick.as_secs().max(1);
    (duration.as_secs() / tick_secs).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedArgvBuilder;

    impl ArgvBuilder for FixedArgvBuilder {
        fn build_args(&self, start_second: f64, output_pattern: &str, _is_hls: bool) -> Vec<String> {
            vec![
                "-ss".into(),
                start_second.to_string(),
                "-f".into(),
                "segment".into(),
                output_pattern.into(),
            ]
        }
    }

    fn test_stream(root: std::path::PathBuf) -> Stream {
        let store = SegmentStore::create(root).unwrap();
        Stream::new(
            "720p".into(),
            store,
            EngineConfig {
                wait_timeout: std::time::Duration::from_millis(200),
                ..EngineConfig::default()
            },
            "/bin/true".into(),
            Arc::new(FixedArgvBuilder),
        )
    }

    #[tokio::test]
    async fn ready_chunk_is_served_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let stream = test_stream(dir.path().to_path_buf());
        std::fs::write(dir.path().join("720p-000000.ts"), b"data").unwrap();

        // Manually mark the chunk done without an encoder, to test the
        // Ready branch in isolation.
        {
            let mut state = stream.0.state.lock().await;
            state.chunks.entry(0).or_insert_with(Chunk::new).mark_done();
        }

        let path = stream.serve_chunk(0).await.unwrap();
        assert_eq!(path, dir.path().join("720p-000000.ts"));
    }

    #[tokio::test]
    async fn miss_branch_launches_an_encoder_and_times_out_when_it_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let stream = test_stream(dir.path().to_path_buf());

        // /bin/true exits immediately without ever writing a segment, so
        // the waiter either sees a conflict (exit observed first) or a
        // timeout, never success.
        let result = stream.serve_chunk(0).await;
        assert!(matches!(
            result,
            Err(EngineError::TransientProducerFailure { id: 0 })
                | Err(EngineError::WaitTimeout { id: 0 })
        ));
    }

    #[tokio::test]
    async fn start_second_clamps_to_zero_for_id_zero() {
        let dir = tempfile::tempdir().unwrap();
        let stream = test_stream(dir.path().to_path_buf());
        assert_eq!(stream.start_second_for(0), 0.0);
        assert_eq!(stream.start_second_for(1), 0.0);
        assert_eq!(stream.start_second_for(5), 12.0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let stream = test_stream(dir.path().to_path_buf());
        stream.stop();
        stream.stop();
    }

    #[tokio::test]
    async fn near_hit_window_looks_back_by_l_but_not_further() {
        let dir = tempfile::tempdir().unwrap();
        let stream = test_stream(dir.path().to_path_buf());
        let mut state = stream.0.state.lock().await;
        state.chunks.insert(2, Chunk::new());

        // id=10 with L=8 covers [2, 10) — chunk 2 is in range.
        assert!(stream.near_hit_locked(&state, 10));
        // id=11 with L=8 covers [3, 11) — chunk 2 has fallen out of range.
        assert!(!stream.near_hit_locked(&state, 11));

        state.chunks.clear();
        assert!(!stream.near_hit_locked(&state, 10));
    }
}
