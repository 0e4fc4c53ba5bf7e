//! The per-present record the engine builds up as correlated events arrive,
//! and the small value types attached to it.

use serde::{Deserialize, Serialize};

use crate::store::Handle;

/// The presentation path a present took through the kernel and compositor.
/// Set by the first classifying event; may be refined along the way
/// (composed to independent, independent to composed-independent) but never
/// reverts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentMode {
    #[default]
    Unknown,
    HardwareLegacyFlip,
    HardwareLegacyCopyToFrontBuffer,
    HardwareIndependentFlip,
    ComposedFlip,
    ComposedCopyGpu,
    ComposedCopyCpu,
    ComposedCompositionAtlas,
    HardwareComposedIndependentFlip,
}

impl PresentMode {
    /// Hardware flip paths complete at their sync DPC; composed paths wait
    /// on the windowing token or the compositor's own present.
    pub fn is_hardware_flip(self) -> bool {
        matches!(
            self,
            PresentMode::HardwareLegacyFlip
                | PresentMode::HardwareIndependentFlip
                | PresentMode::HardwareComposedIndependentFlip
        )
    }
}

impl std::fmt::Display for PresentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PresentMode::Unknown => "Other",
            PresentMode::HardwareLegacyFlip => "Hardware: Legacy Flip",
            PresentMode::HardwareLegacyCopyToFrontBuffer => {
                "Hardware: Legacy Copy to front buffer"
            }
            PresentMode::HardwareIndependentFlip => "Hardware: Independent Flip",
            PresentMode::ComposedFlip => "Composed: Flip",
            PresentMode::ComposedCopyGpu => "Composed: Copy with GPU GDI",
            PresentMode::ComposedCopyCpu => "Composed: Copy with CPU GDI",
            PresentMode::ComposedCompositionAtlas => "Composed: Composition Atlas",
            PresentMode::HardwareComposedIndependentFlip => {
                "Hardware Composed: Independent Flip"
            }
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentResult {
    #[default]
    Unknown,
    Presented,
    Discarded,
    Error,
}

/// Which presentation runtime issued the present. `Other` marks records
/// created from kernel events with no observed runtime call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Runtime {
    Dxgi,
    D3d9,
    #[default]
    Other,
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Runtime::Dxgi => "DXGI",
            Runtime::D3d9 => "D3D9",
            Runtime::Other => "Other",
        })
    }
}

/// Emitted on the process-event channel whenever a process starts or exits.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub image_name: String,
    pub qpc: u64,
    pub pid: u32,
    pub is_start: bool,
}

/// One application present, from runtime submit to on-screen (or discard).
///
/// Correlation keys are filled in progressively as events from the different
/// providers arrive; any of them may stay zero when the corresponding events
/// are never observed. Times are QPC values, zero when unknown.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PresentRecord {
    /// Engine-assigned monotonic id.
    pub id: u64,
    /// QPC of the first event attributed to this present.
    pub qpc_start: u64,
    pub pid: u32,
    pub tid: u32,
    /// Duration between runtime present start and stop.
    pub time_taken: u64,
    /// QPC when the last GPU work prior to presentation completed.
    pub ready_time: u64,
    /// QPC when the present was displayed.
    pub screen_time: u64,

    // Runtime-supplied parameters.
    pub swapchain: u64,
    pub sync_interval: i32,
    pub present_flags: u32,
    pub runtime: Runtime,

    // Correlation keys, learned progressively.
    pub kernel_context: u64,
    pub submit_sequence: u32,
    pub token_ptr: u64,
    pub composition_surface: u64,
    pub composition_present_count: u64,
    pub composition_bind_id: u64,
    pub legacy_blit_token: u64,
    pub hwnd: u64,
    /// Slot in the bounded record ring.
    pub ring_index: u32,

    // Deduced along the presentation pipeline.
    pub present_mode: PresentMode,
    pub final_state: PresentResult,
    pub supports_tearing: bool,
    pub mmio: bool,
    pub seen_dxgk_present: bool,
    pub seen_win32k_events: bool,
    pub dwm_notified: bool,
    pub seen_in_frame: bool,
    /// Final state is decided but the runtime stop is still outstanding.
    pub completion_deferred: bool,
    pub is_completed: bool,
    pub is_lost: bool,
    /// Queued for the compositor's next present.
    pub in_compositor_wait: bool,

    /// Presents whose completion is gated on this one (composed presents
    /// consumed by the compositor's own present).
    #[serde(skip)]
    pub dependents: Vec<Handle>,
}

impl PresentRecord {
    pub fn new(hdr: &crate::events::EventHeader) -> Self {
        PresentRecord {
            qpc_start: hdr.qpc,
            pid: hdr.pid,
            tid: hdr.tid,
            sync_interval: -1,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHeader;

    #[test]
    fn test_new_record_defaults() {
        let rec = PresentRecord::new(&EventHeader { qpc: 100, pid: 10, tid: 1 });
        assert_eq!(rec.qpc_start, 100);
        assert_eq!(rec.sync_interval, -1);
        assert_eq!(rec.present_mode, PresentMode::Unknown);
        assert_eq!(rec.final_state, PresentResult::Unknown);
        assert_eq!(rec.runtime, Runtime::Other);
        assert!(!rec.is_completed);
        assert!(!rec.is_lost);
    }

    #[test]
    fn test_present_mode_display() {
        assert_eq!(PresentMode::HardwareLegacyFlip.to_string(), "Hardware: Legacy Flip");
        assert_eq!(PresentMode::ComposedCopyGpu.to_string(), "Composed: Copy with GPU GDI");
        assert_eq!(PresentMode::Unknown.to_string(), "Other");
    }

    #[test]
    fn test_hardware_flip_classification() {
        assert!(PresentMode::HardwareLegacyFlip.is_hardware_flip());
        assert!(PresentMode::HardwareIndependentFlip.is_hardware_flip());
        assert!(PresentMode::HardwareComposedIndependentFlip.is_hardware_flip());
        assert!(!PresentMode::ComposedFlip.is_hardware_flip());
        assert!(!PresentMode::HardwareLegacyCopyToFrontBuffer.is_hardware_flip());
    }
}
