//! SETTINGS identifiers, defaults, and bounds. Spec §3 "Settings" table.

use enum_map::{enum_map, Enum, EnumMap};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Enum)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    #[must_use]
    pub fn from_wire(id: u16) -> Option<Self> {
        Self::from_u16(id)
    }
}

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_ENABLE_PUSH: u32 = 1;
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = u32::MAX;

/// A SETTINGS map, one instance per direction (what we advertise, what the
/// peer advertised to us). Backed by `EnumMap` as the teacher's `connection.rs`
/// already chose for `SettingsParameter -> u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings(EnumMap<SettingsParameter, u32>);

impl Settings {
    #[must_use]
    pub fn get(&self, param: SettingsParameter) -> u32 {
        self.0[param]
    }

    pub fn set(&mut self, param: SettingsParameter, value: u32) {
        self.0[param] = value;
    }

    #[must_use]
    pub fn header_table_size(&self) -> u32 {
        self.get(SettingsParameter::HeaderTableSize)
    }

    #[must_use]
    pub fn enable_push(&self) -> bool {
        self.get(SettingsParameter::EnablePush) != 0
    }

    #[must_use]
    pub fn max_concurrent_streams(&self) -> u32 {
        self.get(SettingsParameter::MaxConcurrentStreams)
    }

    #[must_use]
    pub fn initial_window_size(&self) -> u32 {
        self.get(SettingsParameter::InitialWindowSize)
    }

    #[must_use]
    pub fn max_frame_size(&self) -> u32 {
        self.get(SettingsParameter::MaxFrameSize)
    }

    #[must_use]
    pub fn max_header_list_size(&self) -> u32 {
        self.get(SettingsParameter::MaxHeaderListSize)
    }

    /// Validate a single identifier/value pair per spec §3's Bounds column.
    /// Unknown identifiers are the caller's concern (they're simply ignored,
    /// per RFC 7540 §6.5.2); this only validates known ones.
    #[must_use]
    pub fn validate(param: SettingsParameter, value: u32) -> bool {
        match param {
            SettingsParameter::EnablePush => value == 0 || value == 1,
            SettingsParameter::InitialWindowSize => value <= crate::types::U31_MAX,
            SettingsParameter::MaxFrameSize => {
                (MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value)
            }
            SettingsParameter::HeaderTableSize
            | SettingsParameter::MaxConcurrentStreams
            | SettingsParameter::MaxHeaderListSize => true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(enum_map! {
            SettingsParameter::HeaderTableSize => DEFAULT_HEADER_TABLE_SIZE,
            SettingsParameter::EnablePush => DEFAULT_ENABLE_PUSH,
            SettingsParameter::MaxConcurrentStreams => DEFAULT_MAX_CONCURRENT_STREAMS,
            SettingsParameter::InitialWindowSize => DEFAULT_INITIAL_WINDOW_SIZE,
            SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
            SettingsParameter::MaxHeaderListSize => DEFAULT_MAX_HEADER_LIST_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rfc() {
        let s = Settings::default();
        assert_eq!(s.header_table_size(), 4096);
        assert!(s.enable_push());
        assert_eq!(s.initial_window_size(), 65_535);
        assert_eq!(s.max_frame_size(), 16_384);
    }

    #[test]
    fn rejects_out_of_range_max_frame_size() {
        assert!(!Settings::validate(SettingsParameter::MaxFrameSize, 100));
        assert!(!Settings::validate(SettingsParameter::MaxFrameSize, 1 << 25));
        assert!(Settings::validate(SettingsParameter::MaxFrameSize, 16_384));
    }

    #[test]
    fn rejects_invalid_enable_push() {
        assert!(!Settings::validate(SettingsParameter::EnablePush, 2));
    }
}
