//! Presentation-runtime handlers: the begin and end of the application's
//! present call, for both runtimes and their multiplane-overlay variants.

use crate::consumer::PresentConsumer;
use crate::events::EventHeader;
use crate::present::{PresentResult, Runtime};
use crate::providers::{
    DXGI_PRESENT_TEST, DXGI_STATUS_MODE_CHANGE_IN_PROGRESS, DXGI_STATUS_NO_DESKTOP_ACCESS,
    DXGI_STATUS_OCCLUDED,
};

/// A present call returning a failure or one of the no-op statuses never
/// entered the presentation pipeline.
fn present_result_succeeded(result: u32) -> bool {
    (result as i32) >= 0
        && !matches!(
            result,
            DXGI_STATUS_OCCLUDED
                | DXGI_STATUS_NO_DESKTOP_ACCESS
                | DXGI_STATUS_MODE_CHANGE_IN_PROGRESS
        )
}

impl PresentConsumer {
    pub(crate) fn runtime_present_start(
        &mut self,
        hdr: &EventHeader,
        runtime: Runtime,
        swapchain: u64,
        flags: u32,
        sync_interval: i32,
    ) {
        let h = self.find_or_create(hdr);
        if let Some(rec) = self.store.get_mut(h) {
            rec.runtime = runtime;
            rec.swapchain = swapchain;
            rec.present_flags = flags;
            if sync_interval >= 0 {
                rec.sync_interval = sync_interval;
            }
        }
    }

    /// End of the runtime present call. Stamps the call duration, ends the
    /// thread association, and completes the record if its fate is already
    /// known (or will never be known, with display tracking off).
    pub(crate) fn runtime_present_stop(&mut self, hdr: &EventHeader, runtime: Runtime, result: u32) {
        if let Some(h) = self.store.by_thread.get(&hdr.tid).copied() {
            self.store.by_thread.remove(&hdr.tid);
            let mut complete = false;
            if let Some(rec) = self.store.get_mut(h) {
                rec.runtime = runtime;
                rec.time_taken = hdr.qpc.saturating_sub(rec.qpc_start);
                let succeeded =
                    present_result_succeeded(result) && rec.present_flags & DXGI_PRESENT_TEST == 0;
                if rec.completion_deferred {
                    // Already finalized; the deferred flush below releases it.
                } else if !succeeded {
                    rec.final_state = PresentResult::Discarded;
                    complete = true;
                } else if !self.config.track_display {
                    // Nothing downstream will be observed.
                    rec.final_state = PresentResult::Presented;
                    complete = true;
                } else if rec.final_state != PresentResult::Unknown && rec.screen_time != 0 {
                    complete = true;
                }
            }
            if complete {
                self.complete_present(h);
            }
        }
        self.observe_present_stop(hdr.pid);
    }
}
