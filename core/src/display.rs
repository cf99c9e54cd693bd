//! Display slots and the registry that owns them.
//!
//! A [`DisplaySlot`] is one virtual desktop: an X display number plus the VNC
//! and web proxy ports that expose it. The provisioning pipeline owns the
//! [`SlotRegistry`] and is the only writer; everything else reads through a
//! [`SlotView`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a display slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Pending,
    Starting,
    Ready,
    Failed,
}

/// Provisioning stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FrameBuffer,
    Desktop,
    RemoteFramebuffer,
    WebProxy,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::FrameBuffer,
        Stage::Desktop,
        Stage::RemoteFramebuffer,
        Stage::WebProxy,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FrameBuffer => "frame buffer",
            Stage::Desktop => "desktop environment",
            Stage::RemoteFramebuffer => "VNC server",
            Stage::WebProxy => "web proxy",
        };
        f.write_str(name)
    }
}

/// One provisioned (or to-be-provisioned) virtual desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySlot {
    pub display_number: u32,
    pub vnc_port: u16,
    pub web_port: u16,
    pub state: DisplayState,
    /// Last stage that reported ready during the current pass
    pub stage: Option<Stage>,
}

impl DisplaySlot {
    pub fn new(display_number: u32, vnc_port: u16, web_port: u16) -> Self {
        Self {
            display_number,
            vnc_port,
            web_port,
            state: DisplayState::Pending,
            stage: None,
        }
    }

    /// X11 `DISPLAY` value for this slot, e.g. `:1`.
    pub fn x_display(&self) -> String {
        format!(":{}", self.display_number)
    }

    pub fn is_ready(&self) -> bool {
        self.state == DisplayState::Ready
    }
}

/// Writable registry of display slots, owned by the provisioning pipeline.
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    slots: Arc<RwLock<Vec<DisplaySlot>>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly allocated topology.
    ///
    /// Slots whose identity (display and ports) is unchanged keep their
    /// current state so a re-run does not flap a healthy display to Pending.
    pub fn install(&self, allocated: Vec<DisplaySlot>) {
        let mut slots = self.slots.write();
        let merged = allocated
            .into_iter()
            .map(|fresh| {
                slots
                    .iter()
                    .find(|old| {
                        old.display_number == fresh.display_number
                            && old.vnc_port == fresh.vnc_port
                            && old.web_port == fresh.web_port
                    })
                    .cloned()
                    .unwrap_or(fresh)
            })
            .collect();
        *slots = merged;
    }

    pub fn set_state(&self, display_number: u32, state: DisplayState) {
        if let Some(slot) = self
            .slots
            .write()
            .iter_mut()
            .find(|s| s.display_number == display_number)
        {
            slot.state = state;
            if state == DisplayState::Starting {
                slot.stage = None;
            }
        }
    }

    pub fn set_all(&self, state: DisplayState) {
        for slot in self.slots.write().iter_mut() {
            slot.state = state;
            if state == DisplayState::Starting {
                slot.stage = None;
            }
        }
    }

    pub fn mark_stage(&self, display_number: u32, stage: Stage) {
        if let Some(slot) = self
            .slots
            .write()
            .iter_mut()
            .find(|s| s.display_number == display_number)
        {
            slot.stage = Some(stage);
        }
    }

    /// Read-only handle sharing the same storage.
    pub fn view(&self) -> SlotView {
        SlotView {
            slots: Arc::clone(&self.slots),
        }
    }

    pub fn snapshot(&self) -> Vec<DisplaySlot> {
        self.slots.read().clone()
    }
}

/// Read-only access to the slot registry.
#[derive(Debug, Clone)]
pub struct SlotView {
    slots: Arc<RwLock<Vec<DisplaySlot>>>,
}

impl SlotView {
    pub fn snapshot(&self) -> Vec<DisplaySlot> {
        self.slots.read().clone()
    }

    pub fn ready(&self) -> Vec<DisplaySlot> {
        self.slots
            .read()
            .iter()
            .filter(|s| s.is_ready())
            .cloned()
            .collect()
    }

    pub fn get(&self, display_number: u32) -> Option<DisplaySlot> {
        self.slots
            .read()
            .iter()
            .find(|s| s.display_number == display_number)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Lowest configured VNC port, the base for display index arithmetic.
    pub fn base_vnc_port(&self) -> Option<u16> {
        self.slots.read().iter().map(|s| s.vnc_port).min()
    }

    pub fn all_ready(&self) -> bool {
        let slots = self.slots.read();
        !slots.is_empty() && slots.iter().all(DisplaySlot::is_ready)
    }
}
