//! The present-correlation engine.
//!
//! A single producer thread feeds typed events through [`PresentConsumer::handle_event`];
//! handlers mutate records in the store and route terminal records through
//! the completion machinery here. Consumer threads drain the completed, lost,
//! and process-event queues from the shared [`EngineOutput`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::events::{Event, EventHeader, Payload};
use crate::present::{PresentRecord, PresentResult, ProcessEvent, Runtime};
use crate::store::{Handle, RecordStore, RING_CAPACITY_DEFAULT};

/// Runtime options for a correlation session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Track presents through the kernel flip paths, the windowing
    /// subsystem, and the compositor. When disabled only the runtime and
    /// queue submit/complete events are consumed, and every successful
    /// present completes at its runtime stop.
    pub track_display: bool,
    /// Only report presents from processes registered on the filter.
    /// Unlisted processes are still correlated (the compositor's own
    /// presents gate everyone else's) but dropped at hand-off.
    pub filter_processes: bool,
    /// Capacity of the in-flight record ring; the hard bound on live
    /// records.
    pub ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            track_display: true,
            filter_processes: false,
            ring_capacity: RING_CAPACITY_DEFAULT,
        }
    }
}

/// Counts of the non-fatal error conditions the engine tolerates.
#[derive(Default)]
pub struct EngineCounters {
    /// Events whose correlation key resolved to no live record.
    pub orphan_events: AtomicU64,
    /// Records displaced from the ring while still in flight.
    pub lost_by_eviction: AtomicU64,
    /// Records displaced from a correlation key by a newer record.
    pub lost_by_replacement: AtomicU64,
    /// Contradictory pipeline state observed while classifying.
    pub classification_errors: AtomicU64,
    /// Handler observed state it could not reconcile.
    pub invariant_breaches: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub orphan_events: u64,
    pub lost_by_eviction: u64,
    pub lost_by_replacement: u64,
    pub classification_errors: u64,
    pub invariant_breaches: u64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            orphan_events: self.orphan_events.load(Ordering::Relaxed),
            lost_by_eviction: self.lost_by_eviction.load(Ordering::Relaxed),
            lost_by_replacement: self.lost_by_replacement.load(Ordering::Relaxed),
            classification_errors: self.classification_errors.load(Ordering::Relaxed),
            invariant_breaches: self.invariant_breaches.load(Ordering::Relaxed),
        }
    }
}

/// The consumer-facing half of the engine: output queues, the process
/// filter, and the error counters. Shared between the producer thread and
/// any number of consumer threads.
#[derive(Default)]
pub struct EngineOutput {
    completed: Mutex<Vec<PresentRecord>>,
    lost: Mutex<Vec<PresentRecord>>,
    process_events: Mutex<Vec<ProcessEvent>>,
    tracked_processes: RwLock<HashSet<u32>>,
    pub counters: EngineCounters,
}

impl EngineOutput {
    /// Swap out and return every completed present queued since the last
    /// call. Per process, records are ordered by start time.
    pub fn dequeue_completed(&self) -> Vec<PresentRecord> {
        std::mem::take(&mut *self.completed.lock().expect("completed queue lock poisoned"))
    }

    /// Swap out and return every lost present, in the order they were lost.
    pub fn dequeue_lost(&self) -> Vec<PresentRecord> {
        std::mem::take(&mut *self.lost.lock().expect("lost queue lock poisoned"))
    }

    /// Swap out and return queued process start/stop events.
    pub fn dequeue_process_events(&self) -> Vec<ProcessEvent> {
        std::mem::take(&mut *self.process_events.lock().expect("process queue lock poisoned"))
    }

    pub fn add_tracked_process(&self, pid: u32) {
        self.tracked_processes
            .write()
            .expect("process filter lock poisoned")
            .insert(pid);
    }

    pub fn remove_tracked_process(&self, pid: u32) {
        self.tracked_processes
            .write()
            .expect("process filter lock poisoned")
            .remove(&pid);
    }

    pub fn is_process_tracked(&self, pid: u32) -> bool {
        self.tracked_processes
            .read()
            .expect("process filter lock poisoned")
            .contains(&pid)
    }

    fn push_completed(&self, rec: PresentRecord) {
        self.completed.lock().expect("completed queue lock poisoned").push(rec);
    }

    fn push_lost(&self, rec: PresentRecord) {
        self.lost.lock().expect("lost queue lock poisoned").push(rec);
    }

    fn push_process_event(&self, event: ProcessEvent) {
        self.process_events.lock().expect("process queue lock poisoned").push(event);
    }
}

/// Why a record left the engine without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossKind {
    Eviction,
    Replacement,
    Shutdown,
}

struct DeferredCompletion {
    handle: Handle,
    stops_remaining: u32,
}

/// The correlation engine. One instance per trace session, owned by the
/// producer thread; see [`EngineOutput`] for the shared half.
pub struct PresentConsumer {
    pub(crate) config: Config,
    pub(crate) store: RecordStore,
    output: Arc<EngineOutput>,

    /// Finalized records still waiting for runtime stops from their process,
    /// in emission order.
    deferred: HashMap<u32, VecDeque<DeferredCompletion>>,

    /// Compositor identity, learned from its schedule-present events.
    pub(crate) dwm_pid: u32,
    pub(crate) dwm_present_tid: u32,
}

impl PresentConsumer {
    pub fn new(config: Config) -> Self {
        let store = RecordStore::new(config.ring_capacity);
        PresentConsumer {
            config,
            store,
            output: Arc::new(EngineOutput::default()),
            deferred: HashMap::new(),
            dwm_pid: 0,
            dwm_present_tid: 0,
        }
    }

    /// The shared queue/filter/counter structure, for consumer threads.
    pub fn output(&self) -> Arc<EngineOutput> {
        Arc::clone(&self.output)
    }

    /// Route one event to its handler. Unknown events are ignored, as are
    /// display-path events when display tracking is off.
    pub fn handle_event(&mut self, event: &Event) {
        let hdr = event.header;
        match &event.payload {
            Payload::DxgiPresentStart { swapchain, flags, sync_interval }
            | Payload::DxgiPresentMpoStart { swapchain, flags, sync_interval } => {
                self.runtime_present_start(&hdr, Runtime::Dxgi, *swapchain, *flags, *sync_interval)
            }
            Payload::DxgiPresentStop { result } | Payload::DxgiPresentMpoStop { result } => {
                self.runtime_present_stop(&hdr, Runtime::Dxgi, *result)
            }
            Payload::D3d9PresentStart { swapchain, flags } => {
                self.runtime_present_start(&hdr, Runtime::D3d9, *swapchain, *flags, -1)
            }
            Payload::D3d9PresentStop { result } => {
                self.runtime_present_stop(&hdr, Runtime::D3d9, *result)
            }
            Payload::DxgkQueueSubmit { packet_type, submit_sequence, context, present } => {
                self.handle_dxgk_queue_submit(&hdr, *packet_type, *submit_sequence, *context, *present)
            }
            Payload::DxgkQueueComplete { submit_sequence } => {
                self.handle_dxgk_queue_complete(&hdr, *submit_sequence)
            }
            Payload::ProcessStart { image_name } => self.handle_process_event(&hdr, image_name, true),
            Payload::ProcessStop { image_name } => self.handle_process_event(&hdr, image_name, false),

            _ if !self.config.track_display => {}

            Payload::DxgkBlit { hwnd, context, redirected } => {
                self.handle_dxgk_blit(&hdr, *hwnd, *context, *redirected)
            }
            Payload::DxgkBlitCancel => self.handle_dxgk_blit_cancel(&hdr),
            Payload::DxgkFlip { interval, mmio } => self.handle_dxgk_flip(&hdr, *interval, *mmio),
            Payload::DxgkFlipMpo => self.handle_dxgk_flip(&hdr, -1, true),
            Payload::DxgkMmioFlip { submit_sequence, flags } => {
                self.handle_dxgk_mmio_flip(&hdr, *submit_sequence, *flags)
            }
            Payload::DxgkMmioFlipMpo { submit_sequence, entry_status } => {
                self.handle_dxgk_mmio_flip_mpo(&hdr, *submit_sequence, *entry_status)
            }
            Payload::DxgkVSyncDpc { submit_sequence } => {
                self.handle_dxgk_sync_dpc(&hdr, *submit_sequence, 1)
            }
            Payload::DxgkVSyncDpcMpo { plane_submit_sequences }
            | Payload::DxgkHSyncDpcMpo { plane_submit_sequences } => {
                let valid = plane_submit_sequences.iter().filter(|&&s| s != 0).count();
                if let Some(&seq) = plane_submit_sequences.iter().find(|&&s| s != 0) {
                    self.handle_dxgk_sync_dpc(&hdr, seq, valid);
                }
            }
            Payload::DxgkPresent { hwnd } => self.handle_dxgk_present(&hdr, *hwnd),
            Payload::DxgkPresentHistoryStart { token, model, token_data }
            | Payload::DxgkPresentHistoryDetailed { token, model, token_data } => {
                self.handle_dxgk_present_history(&hdr, *token, *model, *token_data)
            }
            Payload::DxgkPresentHistoryInfo { token } => {
                self.handle_dxgk_present_history_info(&hdr, *token)
            }
            Payload::DxgkIndependentFlip { submit_sequence } => {
                self.handle_dxgk_independent_flip(&hdr, *submit_sequence)
            }
            Payload::Win32kTokenCompositionSurface { surface, present_count, bind_id } => {
                self.handle_token_composition_surface(&hdr, *surface, *present_count, *bind_id)
            }
            Payload::Win32kTokenStateChanged { surface, present_count, bind_id, state, independent_flip } => {
                self.handle_token_state_changed(
                    &hdr,
                    (*surface, *present_count, *bind_id),
                    *state,
                    *independent_flip,
                )
            }
            Payload::DwmSchedulePresent => self.handle_dwm_schedule_present(&hdr),
            Payload::DwmGetPresentHistory => self.handle_dwm_get_present_history(&hdr),
            Payload::DwmFlipChain { event: _, flip_chain_id, serial_number, hwnd } => {
                self.handle_dwm_flip_chain(&hdr, *flip_chain_id, *serial_number, *hwnd)
            }
            Payload::Unknown => {}
        }
    }

    /// End of session: every record still in flight is drained as lost.
    pub fn finalize(&mut self) {
        for h in self.store.live_handles() {
            if let Some(rec) = self.store.remove(h) {
                self.push_lost(rec, LossKind::Shutdown);
            }
        }
        self.deferred.clear();
    }

    /// The thread's current in-flight present, or a fresh record created
    /// from the header. A completed record still parked on the thread (a
    /// deferral whose stop never arrived) is not resurrected.
    pub(crate) fn find_or_create(&mut self, hdr: &EventHeader) -> Handle {
        if let Some(&h) = self.store.by_thread.get(&hdr.tid) {
            match self.store.get(h) {
                Some(rec) if !rec.is_completed => return h,
                _ => {
                    self.store.by_thread.remove(&hdr.tid);
                }
            }
        }
        self.create_present(hdr)
    }

    pub(crate) fn create_present(&mut self, hdr: &EventHeader) -> Handle {
        let (h, ring_evicted) = self.store.insert(PresentRecord::new(hdr));
        if let Some(prev) = ring_evicted {
            self.push_lost(prev, LossKind::Eviction);
        }
        if let Some(prev) = self.store.index_process(h) {
            self.push_lost(prev, LossKind::Replacement);
        }
        if let Some(prev) = self.store.index_thread(hdr.tid, h) {
            self.push_lost(prev, LossKind::Replacement);
        }
        h
    }

    pub(crate) fn find_by_submit_sequence(&self, seq: u32) -> Option<Handle> {
        let h = self.store.by_submit_sequence.get(&seq).copied()?;
        self.store.get(h).map(|_| h)
    }

    /// Finalize a record and everything its completion implies: older
    /// presents from the same process finish first, then its dependents.
    /// The whole batch is handed off in start-time order.
    pub(crate) fn complete_present(&mut self, h: Handle) {
        match self.store.get(h) {
            None => return,
            Some(rec) if rec.is_completed => {
                self.output.counters.invariant_breaches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(id = rec.id, "present completed twice");
                return;
            }
            Some(_) => {}
        }
        let mut batch: BTreeMap<(u64, u64), Handle> = BTreeMap::new();
        self.collect_completion(h, &mut batch);
        for (_, handle) in batch {
            self.emit_completed(handle);
        }
    }

    fn collect_completion(&mut self, h: Handle, batch: &mut BTreeMap<(u64, u64), Handle>) {
        let (id, pid, qpc, parent_screen, parent_final, deps) = {
            let Some(rec) = self.store.get_mut(h) else { return };
            if rec.is_completed {
                return;
            }
            rec.is_completed = true;
            (
                rec.id,
                rec.pid,
                rec.qpc_start,
                rec.screen_time,
                rec.final_state,
                std::mem::take(&mut rec.dependents),
            )
        };

        // Drop out of the per-process order up front so the sweep below
        // terminates.
        if let Some(order) = self.store.by_process.get_mut(&pid) {
            if order.get(&qpc) == Some(&h) {
                order.remove(&qpc);
            }
            if order.is_empty() {
                self.store.by_process.remove(&pid);
            }
        }

        // Older presents from this process can no longer change state in any
        // way that matters; finish them first so emission stays ordered.
        loop {
            let older = self
                .store
                .by_process
                .get(&pid)
                .and_then(|order| order.range(..qpc).next())
                .map(|(_, &h2)| h2);
            let Some(h2) = older else { break };
            if let Some(r2) = self.store.get_mut(h2) {
                if r2.final_state == PresentResult::Unknown {
                    r2.final_state = if r2.screen_time != 0 {
                        PresentResult::Presented
                    } else {
                        PresentResult::Discarded
                    };
                }
            }
            self.collect_completion(h2, batch);
        }

        batch.insert((qpc, id), h);

        // Dependents were waiting on this present's screen time.
        for dh in deps {
            {
                let Some(dep) = self.store.get_mut(dh) else { continue };
                if dep.is_completed {
                    continue;
                }
                dep.in_compositor_wait = false;
                if dep.screen_time == 0
                    && parent_screen != 0
                    && dep.final_state != PresentResult::Discarded
                {
                    dep.screen_time = parent_screen;
                    dep.final_state = PresentResult::Presented;
                } else if dep.final_state == PresentResult::Unknown {
                    dep.final_state = parent_final;
                }
            }
            self.collect_completion(dh, batch);
        }
    }

    /// Hand one finalized record to the output queue, or park it behind the
    /// runtime stops its process still owes.
    fn emit_completed(&mut self, h: Handle) {
        let (pid, needs_stop) = {
            let Some(rec) = self.store.get(h) else { return };
            (rec.pid, rec.runtime != Runtime::Other && rec.time_taken == 0)
        };
        if needs_stop {
            if let Some(rec) = self.store.get_mut(h) {
                rec.completion_deferred = true;
            }
            // Keep the thread entry so the pending stop can find the record
            // and stamp its duration.
            self.store.purge_indexes(h, true);
            self.deferred
                .entry(pid)
                .or_default()
                .push_back(DeferredCompletion { handle: h, stops_remaining: 1 });
        } else if self.deferred.get(&pid).is_some_and(|q| !q.is_empty()) {
            // An earlier present from this process is still parked; queue
            // behind it to preserve per-process emission order.
            self.store.purge_indexes(h, false);
            self.deferred
                .entry(pid)
                .or_default()
                .push_back(DeferredCompletion { handle: h, stops_remaining: 0 });
        } else if let Some(rec) = self.store.remove(h) {
            self.push_completed(rec);
        }
    }

    /// A runtime present stop was observed on this process: release the
    /// first deferred record still waiting for one, then emit the ready
    /// prefix of the queue.
    pub(crate) fn observe_present_stop(&mut self, pid: u32) {
        if let Some(queue) = self.deferred.get_mut(&pid) {
            let store = &self.store;
            queue.retain(|entry| store.get(entry.handle).is_some());
            for entry in queue.iter_mut() {
                if entry.stops_remaining > 0 {
                    entry.stops_remaining -= 1;
                    break;
                }
            }
        }
        loop {
            let next = match self.deferred.get_mut(&pid) {
                Some(queue) if queue.front().is_some_and(|e| e.stops_remaining == 0) => {
                    queue.pop_front().map(|e| e.handle)
                }
                _ => None,
            };
            let Some(h) = next else { break };
            if let Some(rec) = self.store.remove(h) {
                self.push_completed(rec);
            }
        }
        if self.deferred.get(&pid).is_some_and(|q| q.is_empty()) {
            self.deferred.remove(&pid);
        }
    }

    fn handle_process_event(&mut self, hdr: &EventHeader, image_name: &str, is_start: bool) {
        self.output.push_process_event(ProcessEvent {
            image_name: image_name.to_string(),
            qpc: hdr.qpc,
            pid: hdr.pid,
            is_start,
        });
    }

    fn push_completed(&mut self, rec: PresentRecord) {
        if self.config.filter_processes && !self.output.is_process_tracked(rec.pid) {
            return;
        }
        self.output.push_completed(rec);
    }

    pub(crate) fn push_lost(&mut self, mut rec: PresentRecord, kind: LossKind) {
        match kind {
            LossKind::Eviction => {
                self.output.counters.lost_by_eviction.fetch_add(1, Ordering::Relaxed);
            }
            LossKind::Replacement => {
                self.output.counters.lost_by_replacement.fetch_add(1, Ordering::Relaxed);
            }
            LossKind::Shutdown => {}
        }
        rec.is_lost = true;
        if self.config.filter_processes && !self.output.is_process_tracked(rec.pid) {
            return;
        }
        self.output.push_lost(rec);
    }

    pub(crate) fn note_orphan(&self, what: &'static str, key: u64) {
        self.output.counters.orphan_events.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(what, key, "event did not resolve to a live present");
    }

    pub(crate) fn note_classification_error(&self) {
        self.output.counters.classification_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::PresentMode;
    use crate::providers::QueuePacketType;

    fn ev(qpc: u64, pid: u32, tid: u32, payload: Payload) -> Event {
        Event { header: EventHeader { qpc, pid, tid }, payload }
    }

    fn consumer() -> PresentConsumer {
        PresentConsumer::new(Config::default())
    }

    /// The canonical hardware legacy flip sequence: runtime start, flip,
    /// queue submit, runtime stop, mmio flip, vsync.
    fn legacy_flip_events(pid: u32, tid: u32, qpc: u64, seq: u32) -> Vec<Event> {
        vec![
            ev(qpc, pid, tid, Payload::DxgiPresentStart { swapchain: 0xA, flags: 0, sync_interval: 1 }),
            ev(qpc + 2, pid, tid, Payload::DxgkFlip { interval: 1, mmio: true }),
            ev(
                qpc + 4,
                pid,
                tid,
                Payload::DxgkQueueSubmit {
                    packet_type: QueuePacketType::MmioFlipCommandBuffer,
                    submit_sequence: seq,
                    context: 0xC0 + seq as u64,
                    present: true,
                },
            ),
            ev(qpc + 10, pid, tid, Payload::DxgiPresentStop { result: 0 }),
            ev(qpc + 100, pid, tid, Payload::DxgkMmioFlip { submit_sequence: seq, flags: 0 }),
            ev(qpc + 200, pid, tid, Payload::DxgkVSyncDpc { submit_sequence: seq }),
        ]
    }

    #[test]
    fn test_hardware_legacy_flip_presented() {
        let mut consumer = consumer();
        let events = vec![
            ev(100, 10, 1, Payload::DxgiPresentStart { swapchain: 0xA, flags: 0, sync_interval: 1 }),
            ev(101, 10, 1, Payload::DxgkFlip { interval: 1, mmio: true }),
            ev(
                102,
                10,
                1,
                Payload::DxgkQueueSubmit {
                    packet_type: QueuePacketType::MmioFlipCommandBuffer,
                    submit_sequence: 7,
                    context: 0xC,
                    present: true,
                },
            ),
            ev(110, 10, 1, Payload::DxgiPresentStop { result: 0 }),
            ev(200, 10, 1, Payload::DxgkMmioFlip { submit_sequence: 7, flags: 0 }),
            ev(300, 10, 1, Payload::DxgkVSyncDpc { submit_sequence: 7 }),
        ];
        for event in &events {
            consumer.handle_event(event);
        }

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        let rec = &completed[0];
        assert_eq!(rec.pid, 10);
        assert_eq!(rec.present_mode, PresentMode::HardwareLegacyFlip);
        assert_eq!(rec.qpc_start, 100);
        assert_eq!(rec.time_taken, 10);
        assert_eq!(rec.ready_time, 200);
        assert_eq!(rec.screen_time, 300);
        assert_eq!(rec.final_state, PresentResult::Presented);
        assert_eq!(rec.runtime, Runtime::Dxgi);
        assert!(rec.mmio);
        assert!(!rec.is_lost);
        assert_eq!(consumer.store.live_count(), 0);
    }

    #[test]
    fn test_composed_flip_discarded_by_in_frame_replacement() {
        let mut consumer = consumer();
        let window = 0x5151;
        for (qpc, token) in [(100u64, 1u64), (200, 2)] {
            consumer.handle_event(&ev(qpc, 10, 1, Payload::DxgiPresentStart {
                swapchain: 0xA,
                flags: 0,
                sync_interval: 1,
            }));
            consumer.handle_event(&ev(qpc + 1, 10, 1, Payload::Win32kTokenCompositionSurface {
                surface: 0x60,
                present_count: token,
                bind_id: 1,
            }));
            consumer.handle_event(&ev(qpc + 2, 10, 1, Payload::DxgkPresent { hwnd: window }));
            consumer.handle_event(&ev(qpc + 5, 10, 1, Payload::DxgiPresentStop { result: 0 }));
            consumer.handle_event(&ev(qpc + 10, 10, 1, Payload::Win32kTokenStateChanged {
                surface: 0x60,
                present_count: token,
                bind_id: 1,
                state: crate::providers::TokenState::InFrame,
                independent_flip: false,
            }));
        }

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].qpc_start, 100);
        assert_eq!(completed[0].final_state, PresentResult::Discarded);
        assert_eq!(completed[0].present_mode, PresentMode::ComposedFlip);

        // The second present is still in flight and holds the window.
        assert_eq!(consumer.store.live_count(), 1);
        assert_eq!(consumer.store.by_window_last.len(), 1);
    }

    #[test]
    fn test_hardware_copy_to_front_buffer() {
        let mut consumer = consumer();
        let events = vec![
            ev(100, 10, 1, Payload::DxgiPresentStart { swapchain: 0xA, flags: 0, sync_interval: 0 }),
            ev(101, 10, 1, Payload::DxgkBlit { hwnd: 0x77, context: 0xC, redirected: false }),
            ev(
                102,
                10,
                1,
                Payload::DxgkQueueSubmit {
                    packet_type: QueuePacketType::RenderCommandBuffer,
                    submit_sequence: 9,
                    context: 0xC,
                    present: true,
                },
            ),
            ev(110, 10, 1, Payload::DxgiPresentStop { result: 0 }),
            ev(500, 10, 1, Payload::DxgkQueueComplete { submit_sequence: 9 }),
        ];
        for event in &events {
            consumer.handle_event(event);
        }

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        let rec = &completed[0];
        assert_eq!(rec.present_mode, PresentMode::HardwareLegacyCopyToFrontBuffer);
        assert_eq!(rec.ready_time, 500);
        assert_eq!(rec.screen_time, 500);
        assert_eq!(rec.final_state, PresentResult::Presented);
        assert!(rec.supports_tearing);
    }

    #[test]
    fn test_dropped_vsync_evicted_as_lost() {
        let mut consumer = PresentConsumer::new(Config { ring_capacity: 4, ..Config::default() });
        // A present whose vsync never arrives.
        let mut events = legacy_flip_events(10, 1, 100, 7);
        events.pop();
        for event in &events {
            consumer.handle_event(event);
        }
        // Enough unrelated presents to wrap the ring.
        for i in 0..4u32 {
            for event in legacy_flip_events(20, 100 + i, 10_000 + 1000 * i as u64, 50 + i) {
                consumer.handle_event(&event);
            }
        }

        let lost = consumer.output().dequeue_lost();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].is_lost);
        assert_eq!(lost[0].qpc_start, 100);
        assert_eq!(lost[0].final_state, PresentResult::Unknown);
        assert_eq!(consumer.output().counters.snapshot().lost_by_eviction, 1);
    }

    #[test]
    fn test_per_process_ordering() {
        let mut consumer = consumer();
        // Three presents on separate threads, completed out of order.
        for (tid, qpc, seq) in [(1u32, 100u64, 7u32), (2, 110, 8), (3, 120, 9)] {
            let mut events = legacy_flip_events(10, tid, qpc, seq);
            events.truncate(5); // hold back the vsync
            for event in &events {
                consumer.handle_event(event);
            }
        }
        for seq in [9u32, 7, 8] {
            consumer.handle_event(&ev(1000 + seq as u64, 10, 99, Payload::DxgkVSyncDpc {
                submit_sequence: seq,
            }));
        }

        let starts: Vec<u64> = consumer
            .output()
            .dequeue_completed()
            .iter()
            .filter(|r| r.pid == 10)
            .map(|r| r.qpc_start)
            .collect();
        assert_eq!(starts, vec![100, 110, 120]);
    }

    #[test]
    fn test_deferred_completion_waits_for_present_stop() {
        let mut consumer = consumer();
        let events = vec![
            ev(100, 10, 1, Payload::DxgiPresentStart { swapchain: 0xA, flags: 0, sync_interval: 1 }),
            ev(101, 10, 1, Payload::DxgkFlip { interval: 1, mmio: true }),
            ev(
                102,
                10,
                1,
                Payload::DxgkQueueSubmit {
                    packet_type: QueuePacketType::MmioFlipCommandBuffer,
                    submit_sequence: 7,
                    context: 0xC,
                    present: true,
                },
            ),
            ev(200, 10, 1, Payload::DxgkMmioFlip { submit_sequence: 7, flags: 0 }),
            // On-screen before the runtime stop.
            ev(300, 10, 1, Payload::DxgkVSyncDpc { submit_sequence: 7 }),
        ];
        for event in &events {
            consumer.handle_event(event);
        }
        assert!(consumer.output().dequeue_completed().is_empty());

        consumer.handle_event(&ev(310, 10, 1, Payload::DxgiPresentStop { result: 0 }));
        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        let rec = &completed[0];
        assert!(rec.completion_deferred);
        assert_eq!(rec.screen_time, 300);
        assert_eq!(rec.time_taken, 210);
        assert_eq!(rec.final_state, PresentResult::Presented);
    }

    #[test]
    fn test_deferred_completion_blocks_later_presents() {
        let mut consumer = consumer();
        // First present reaches the screen before its runtime stop.
        let first = vec![
            ev(100, 10, 1, Payload::DxgiPresentStart { swapchain: 0xA, flags: 0, sync_interval: 1 }),
            ev(101, 10, 1, Payload::DxgkFlip { interval: 1, mmio: true }),
            ev(
                102,
                10,
                1,
                Payload::DxgkQueueSubmit {
                    packet_type: QueuePacketType::MmioFlipCommandBuffer,
                    submit_sequence: 7,
                    context: 0xC,
                    present: true,
                },
            ),
            ev(200, 10, 1, Payload::DxgkMmioFlip { submit_sequence: 7, flags: 0 }),
            ev(300, 10, 1, Payload::DxgkVSyncDpc { submit_sequence: 7 }),
        ];
        for event in &first {
            consumer.handle_event(event);
        }
        // A second, kernel-only present from the same process completes
        // while the first is parked; it must queue behind it.
        let second = vec![
            ev(400, 10, 2, Payload::DxgkFlip { interval: 1, mmio: true }),
            ev(
                402,
                10,
                2,
                Payload::DxgkQueueSubmit {
                    packet_type: QueuePacketType::MmioFlipCommandBuffer,
                    submit_sequence: 8,
                    context: 0xD,
                    present: true,
                },
            ),
            ev(500, 10, 2, Payload::DxgkMmioFlip { submit_sequence: 8, flags: 0 }),
            ev(600, 10, 2, Payload::DxgkVSyncDpc { submit_sequence: 8 }),
        ];
        for event in &second {
            consumer.handle_event(event);
        }
        assert!(consumer.output().dequeue_completed().is_empty());

        consumer.handle_event(&ev(900, 10, 1, Payload::DxgiPresentStop { result: 0 }));
        let starts: Vec<u64> = consumer
            .output()
            .dequeue_completed()
            .iter()
            .map(|r| r.qpc_start)
            .collect();
        assert_eq!(starts, vec![100, 400]);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut consumer = consumer();
        let events = legacy_flip_events(10, 1, 100, 7);
        // Duplicate every pre-completion event.
        for event in &events[..5] {
            consumer.handle_event(event);
            consumer.handle_event(event);
        }
        consumer.handle_event(&events[5]);

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].present_mode, PresentMode::HardwareLegacyFlip);
        assert_eq!(completed[0].final_state, PresentResult::Presented);
        assert!(consumer.output().dequeue_lost().is_empty());
    }

    #[test]
    fn test_ring_capacity_bound() {
        let capacity = 8;
        let total = 20u32;
        let mut consumer =
            PresentConsumer::new(Config { ring_capacity: capacity, ..Config::default() });
        for i in 0..total {
            consumer.handle_event(&ev(100 + i as u64, 10, i + 1, Payload::DxgiPresentStart {
                swapchain: 0xA,
                flags: 0,
                sync_interval: 1,
            }));
        }
        let lost = consumer.output().dequeue_lost();
        assert_eq!(lost.len(), (total as usize) - capacity);
        assert_eq!(consumer.store.live_count(), capacity);
        // Oldest records go first.
        assert_eq!(lost[0].qpc_start, 100);
    }

    #[test]
    fn test_track_display_disabled_completes_at_stop() {
        let mut consumer =
            PresentConsumer::new(Config { track_display: false, ..Config::default() });
        consumer.handle_event(&ev(100, 10, 1, Payload::DxgiPresentStart {
            swapchain: 0xA,
            flags: 0,
            sync_interval: 1,
        }));
        // Display events must be ignored outright.
        consumer.handle_event(&ev(101, 10, 1, Payload::DxgkFlip { interval: 1, mmio: true }));
        consumer.handle_event(&ev(110, 10, 1, Payload::DxgiPresentStop { result: 0 }));

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].final_state, PresentResult::Presented);
        assert_eq!(completed[0].present_mode, PresentMode::Unknown);
        assert_eq!(completed[0].screen_time, 0);
        assert_eq!(completed[0].time_taken, 10);
    }

    #[test]
    fn test_process_filter_drops_unlisted_pids() {
        let mut consumer =
            PresentConsumer::new(Config { filter_processes: true, ..Config::default() });
        consumer.output().add_tracked_process(10);
        for event in legacy_flip_events(10, 1, 100, 7) {
            consumer.handle_event(&event);
        }
        for event in legacy_flip_events(20, 2, 5000, 8) {
            consumer.handle_event(&event);
        }

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].pid, 10);
    }

    #[test]
    fn test_process_events_channel() {
        let mut consumer = consumer();
        consumer.handle_event(&ev(50, 10, 1, Payload::ProcessStart {
            image_name: "game.exe".to_string(),
        }));
        consumer.handle_event(&ev(900, 10, 1, Payload::ProcessStop {
            image_name: "game.exe".to_string(),
        }));

        let events = consumer.output().dequeue_process_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].image_name, "game.exe");
        assert!(events[0].is_start);
        assert!(!events[1].is_start);
        assert_eq!(events[1].qpc, 900);
    }

    #[test]
    fn test_finalize_drains_live_as_lost() {
        let mut consumer = consumer();
        let mut events = legacy_flip_events(10, 1, 100, 7);
        events.pop(); // never reaches the screen
        for event in &events {
            consumer.handle_event(event);
        }
        consumer.finalize();

        assert_eq!(consumer.store.live_count(), 0);
        let lost = consumer.output().dequeue_lost();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].is_lost);
    }

    #[test]
    fn test_missing_ready_time_is_classification_error() {
        let mut consumer = consumer();
        let mut events = legacy_flip_events(10, 1, 100, 7);
        events.remove(4); // drop the mmio flip that carries the ready time
        for event in &events {
            consumer.handle_event(event);
        }

        let completed = consumer.output().dequeue_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].final_state, PresentResult::Error);
        assert_eq!(consumer.output().counters.snapshot().classification_errors, 1);
    }

    #[test]
    fn test_unresolved_key_counts_orphan() {
        let mut consumer = consumer();
        consumer.handle_event(&ev(100, 10, 1, Payload::DxgkVSyncDpc { submit_sequence: 777 }));
        assert_eq!(consumer.output().counters.snapshot().orphan_events, 1);
        assert!(consumer.output().dequeue_completed().is_empty());
    }

    #[test]
    fn test_double_completion_counts_invariant_breach() {
        let mut consumer = consumer();
        consumer.handle_event(&ev(100, 10, 1, Payload::DxgiPresentStart {
            swapchain: 0xA,
            flags: 0,
            sync_interval: 1,
        }));
        let h = *consumer.store.by_thread.get(&1).unwrap();
        consumer.store.get_mut(h).unwrap().final_state = PresentResult::Discarded;
        consumer.complete_present(h);
        consumer.complete_present(h);
        assert_eq!(consumer.output().counters.snapshot().invariant_breaches, 1);
    }

    #[test]
    fn test_replayed_sequence_is_deterministic() {
        let run = || {
            let mut consumer = PresentConsumer::new(Config::default());
            for (tid, qpc, seq) in [(1u32, 100u64, 7u32), (2, 110, 8)] {
                for event in legacy_flip_events(10, tid, qpc, seq) {
                    consumer.handle_event(&event);
                }
            }
            consumer
                .output()
                .dequeue_completed()
                .iter()
                .map(|r| (r.qpc_start, r.present_mode, r.final_state, r.screen_time))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
