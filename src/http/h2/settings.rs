//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS parameters as defined in
//! RFC 7540 Section 6.5.
//!
//! A [`Settings`] value is a partial parameter set: exactly what one
//! SETTINGS frame carries. The effective value of a parameter falls back to
//! the RFC default when it was never announced, which is how the remote
//! side's settings behave before (and between) SETTINGS frames.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest legal SETTINGS_MAX_FRAME_SIZE (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// Largest legal flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    /// None = unlimited
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    /// None = unlimited
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings (every parameter at its RFC default)
    pub fn new() -> Self {
        Settings::default()
    }

    /// Settings a server announces unless configured otherwise
    pub fn server_defaults() -> Self {
        Settings {
            header_table_size: Some(DEFAULT_HEADER_TABLE_SIZE),
            enable_push: Some(false),
            max_concurrent_streams: Some(100),
            initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: None,
        }
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    /// Push is enabled unless the peer said otherwise
    pub fn enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.initial_window_size {
            if size > MAX_WINDOW_SIZE {
                return Err(Error::FlowControl(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    size
                )));
            }
        }

        if let Some(size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        fn take<T: Copy>(dst: &mut Option<T>, src: Option<T>) {
            if src.is_some() {
                *dst = src;
            }
        }

        take(&mut self.header_table_size, other.header_table_size);
        take(&mut self.enable_push, other.enable_push);
        take(&mut self.max_concurrent_streams, other.max_concurrent_streams);
        take(&mut self.initial_window_size, other.initial_window_size);
        take(&mut self.max_frame_size, other.max_frame_size);
        take(&mut self.max_header_list_size, other.max_header_list_size);
    }

    /// Parse a SETTINGS frame payload
    ///
    /// Unknown parameters are ignored per RFC 7540 Section 6.5.2.
    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);

            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => settings.header_table_size = Some(value),
                Some(SettingsParameter::EnablePush) => {
                    settings.enable_push = Some(match value {
                        0 => false,
                        1 => true,
                        other => {
                            return Err(Error::Protocol(format!(
                                "SETTINGS_ENABLE_PUSH must be 0 or 1, got {}",
                                other
                            )))
                        }
                    })
                }
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                None => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Serialize the announced parameters as a SETTINGS frame payload
    pub fn encode_payload(&self) -> Bytes {
        let params = [
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, self.enable_push.map(u32::from)),
            (SettingsParameter::MaxConcurrentStreams, self.max_concurrent_streams),
            (SettingsParameter::InitialWindowSize, self.initial_window_size),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
            (SettingsParameter::MaxHeaderListSize, self.max_header_list_size),
        ];

        let mut buf = BytesMut::with_capacity(params.len() * 6);
        for (param, value) in params {
            if let Some(value) = value {
                buf.put_u16(param.as_u16());
                buf.put_u32(value);
            }
        }
        buf.freeze()
    }
}

/// Builder for HTTP/2 settings
#[derive(Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    /// Start from an existing parameter set
    pub fn from_settings(settings: Settings) -> Self {
        SettingsBuilder { settings }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
