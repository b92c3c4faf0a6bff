//! Real-time clock integration
//!
//! A node without an uplink keeps wall-clock time on a battery-backed RTC.
//! Hardware drivers implement [`TimeSource`]; [`RtcManager`] owns the
//! active source exclusively and resynchronises it whenever a trusted
//! timestamp arrives from the mesh.
//!
//! Unix times are in seconds; `now` arguments are mesh clock milliseconds.

use crate::error::{MeshError, MeshResult};
use canopy_core::time::MILLIS_PER_SECOND;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Supported RTC hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtcKind {
    None = 0,
    Ds3231 = 1,
    Ds1307 = 2,
    Pcf8523 = 3,
    Pcf8563 = 4,
    Esp32Internal = 5,
}

impl RtcKind {
    /// Numeric code
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for RtcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RtcKind::None => "none",
            RtcKind::Ds3231 => "DS3231",
            RtcKind::Ds1307 => "DS1307",
            RtcKind::Pcf8523 => "PCF8523",
            RtcKind::Pcf8563 => "PCF8563",
            RtcKind::Esp32Internal => "ESP32 internal",
        };
        f.write_str(name)
    }
}

/// A wall-clock source
pub trait TimeSource {
    /// Initialise the device
    fn begin(&mut self) -> MeshResult<()>;

    /// Device responds
    fn is_available(&self) -> bool;

    /// Current unix time in seconds
    fn unix_time(&self, now: u64) -> u64;

    /// Set the device time
    fn set_unix_time(&mut self, unix_time: u64, now: u64) -> MeshResult<()>;

    /// Hardware kind
    fn kind(&self) -> RtcKind;
}

/// Shared presence flag, for simulating a device dropping off the bus
#[derive(Debug, Clone)]
pub struct RtcPresence(Rc<Cell<bool>>);

impl RtcPresence {
    /// Mark the device as present or absent
    pub fn set_present(&self, present: bool) {
        self.0.set(present);
    }

    /// Current flag
    pub fn is_present(&self) -> bool {
        self.0.get()
    }
}

/// RTC kept in software, ticking with the mesh clock
#[derive(Debug)]
pub struct SoftwareRtc {
    kind: RtcKind,
    anchor_unix: u64,
    anchor_ms: u64,
    presence: RtcPresence,
}

impl SoftwareRtc {
    /// Source reading `unix_time` at mesh time `now`
    pub fn new(kind: RtcKind, unix_time: u64, now: u64) -> Self {
        Self {
            kind,
            anchor_unix: unix_time,
            anchor_ms: now,
            presence: RtcPresence(Rc::new(Cell::new(true))),
        }
    }

    /// Handle controlling whether the device reports itself available
    pub fn presence(&self) -> RtcPresence {
        self.presence.clone()
    }
}

impl TimeSource for SoftwareRtc {
    fn begin(&mut self) -> MeshResult<()> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.presence.is_present()
    }

    fn unix_time(&self, now: u64) -> u64 {
        self.anchor_unix + now.saturating_sub(self.anchor_ms) / MILLIS_PER_SECOND
    }

    fn set_unix_time(&mut self, unix_time: u64, now: u64) -> MeshResult<()> {
        if !self.is_available() {
            return Err(MeshError::Rtc(format!("{} not responding", self.kind)));
        }
        self.anchor_unix = unix_time;
        self.anchor_ms = now;
        Ok(())
    }

    fn kind(&self) -> RtcKind {
        self.kind
    }
}

/// How a [`FailingRtc`] misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// `begin` fails
    InitFails,
    /// Initialises but never reports available
    Unavailable,
    /// Available, but writes are rejected
    WriteFails,
}

/// Broken device for exercising error paths
#[derive(Debug, Clone, Copy)]
pub struct FailingRtc {
    mode: FailureMode,
}

impl FailingRtc {
    /// Source that fails the way `mode` describes
    pub fn new(mode: FailureMode) -> Self {
        Self { mode }
    }
}

impl TimeSource for FailingRtc {
    fn begin(&mut self) -> MeshResult<()> {
        match self.mode {
            FailureMode::InitFails => Err(MeshError::Rtc("initialisation failed".to_string())),
            _ => Ok(()),
        }
    }

    fn is_available(&self) -> bool {
        self.mode == FailureMode::WriteFails
    }

    fn unix_time(&self, _now: u64) -> u64 {
        0
    }

    fn set_unix_time(&mut self, _unix_time: u64, _now: u64) -> MeshResult<()> {
        Err(MeshError::Rtc("write rejected".to_string()))
    }

    fn kind(&self) -> RtcKind {
        RtcKind::None
    }
}

/// Owner of the active time source
#[derive(Default)]
pub struct RtcManager {
    source: Option<Box<dyn TimeSource>>,
    last_sync: Option<u64>,
}

impl fmt::Debug for RtcManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcManager")
            .field("kind", &self.source.as_ref().map(|s| s.kind()))
            .field("last_sync", &self.last_sync)
            .finish()
    }
}

impl RtcManager {
    /// Manager with no time source
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `source`. Fails, leaving the manager disabled, if
    /// the device cannot be initialised or does not respond.
    pub fn enable(&mut self, mut source: Box<dyn TimeSource>) -> MeshResult<()> {
        self.disable();

        if let Err(e) = source.begin() {
            warn!(kind = %source.kind(), error = %e, "RTC initialisation failed");
            return Err(e);
        }
        if !source.is_available() {
            warn!(kind = %source.kind(), "RTC not available after initialisation");
            return Err(MeshError::Rtc(format!("{} not available", source.kind())));
        }

        info!(kind = %source.kind(), "RTC enabled");
        self.source = Some(source);
        Ok(())
    }

    /// Release the source and forget sync state
    pub fn disable(&mut self) {
        if self.source.take().is_some() {
            debug!("RTC disabled");
        }
        self.last_sync = None;
    }

    /// A source is installed and responding
    pub fn is_enabled(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_available())
    }

    /// Current unix time, or 0 when disabled
    pub fn get_time(&self, now: u64) -> u64 {
        match &self.source {
            Some(source) if source.is_available() => source.unix_time(now),
            _ => 0,
        }
    }

    /// Write a trusted timestamp to the device. Fails without touching the
    /// device for a zero timestamp or an unavailable source.
    pub fn sync_from_ntp(&mut self, unix_time: u64, now: u64) -> MeshResult<()> {
        if unix_time == 0 {
            return Err(MeshError::Rtc("refusing to sync to timestamp 0".to_string()));
        }
        let source = match self.source.as_mut() {
            Some(source) if source.is_available() => source,
            _ => return Err(MeshError::Rtc("RTC not enabled".to_string())),
        };

        source.set_unix_time(unix_time, now)?;
        self.last_sync = Some(now);
        debug!(unix_time, "RTC synchronised");
        Ok(())
    }

    /// Milliseconds since the last successful sync, 0 if never synced
    pub fn time_since_last_sync(&self, now: u64) -> u64 {
        self.last_sync
            .map(|at| now.saturating_sub(at))
            .unwrap_or(0)
    }

    /// Whether a sync has succeeded since enabling
    pub fn has_synced(&self) -> bool {
        self.last_sync.is_some()
    }

    /// Kind of the active source, `None` when disabled
    pub fn kind(&self) -> RtcKind {
        match &self.source {
            Some(source) if source.is_available() => source.kind(),
            _ => RtcKind::None,
        }
    }
}
