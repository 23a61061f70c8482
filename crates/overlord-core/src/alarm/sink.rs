//! Alert outputs: the full-screen render, audio playback and vibration.
//!
//! Delivery drives an [`AlertSink`] and treats every output as best effort. A
//! failing speaker must not keep the screen from showing or the alarm from
//! being resolved.

use std::sync::Mutex;

use super::types::{AlarmKey, AlarmPayload};
use crate::error::SinkError;
use crate::profile::SoundDescriptor;

pub trait AlertSink: Send + Sync {
    /// Show the alert for `payload`. Must be visible over a locked screen.
    fn render(&self, payload: &AlarmPayload) -> Result<(), SinkError>;
    fn dismiss_render(&self, key: AlarmKey) -> Result<(), SinkError>;

    /// Start looping `sound` at alarm volume.
    fn start_audio(&self, key: AlarmKey, sound: &SoundDescriptor) -> Result<(), SinkError>;
    fn stop_audio(&self, key: AlarmKey) -> Result<(), SinkError>;

    /// Start a repeating vibration; `pattern` alternates off/on milliseconds.
    fn start_vibration(&self, key: AlarmKey, pattern: &[u64]) -> Result<(), SinkError>;
    fn stop_vibration(&self, key: AlarmKey) -> Result<(), SinkError>;
}

/// A sink with no hardware behind it: every output becomes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn render(&self, payload: &AlarmPayload) -> Result<(), SinkError> {
        tracing::info!(
            key = %payload.key,
            label = %payload.label,
            scheduled = %payload.scheduled_time,
            dismiss_required = payload.requires_user_dismiss,
            "ALARM"
        );
        Ok(())
    }

    fn dismiss_render(&self, key: AlarmKey) -> Result<(), SinkError> {
        tracing::info!(%key, "alert closed");
        Ok(())
    }

    fn start_audio(&self, key: AlarmKey, sound: &SoundDescriptor) -> Result<(), SinkError> {
        tracing::info!(
            %key,
            source = sound.source.as_str(),
            sound = sound.name.as_deref().unwrap_or("default"),
            "audio on"
        );
        Ok(())
    }

    fn stop_audio(&self, key: AlarmKey) -> Result<(), SinkError> {
        tracing::debug!(%key, "audio off");
        Ok(())
    }

    fn start_vibration(&self, key: AlarmKey, pattern: &[u64]) -> Result<(), SinkError> {
        tracing::debug!(%key, ?pattern, "vibration on");
        Ok(())
    }

    fn stop_vibration(&self, key: AlarmKey) -> Result<(), SinkError> {
        tracing::debug!(%key, "vibration off");
        Ok(())
    }
}

/// One call made on a [`RecordingAlertSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Render(AlarmKey),
    DismissRender(AlarmKey),
    StartAudio(AlarmKey),
    StopAudio(AlarmKey),
    StartVibration(AlarmKey),
    StopVibration(AlarmKey),
}

/// Records every call; used by embedders' tests and our own.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    calls: Mutex<Vec<SinkCall>>,
    failing_audio: bool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose `start_audio` always fails.
    pub fn with_failing_audio() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_audio: true,
        }
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, call: &SinkCall) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| *c == call)
            .count()
    }

    fn record(&self, call: SinkCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

impl AlertSink for RecordingAlertSink {
    fn render(&self, payload: &AlarmPayload) -> Result<(), SinkError> {
        self.record(SinkCall::Render(payload.key));
        Ok(())
    }

    fn dismiss_render(&self, key: AlarmKey) -> Result<(), SinkError> {
        self.record(SinkCall::DismissRender(key));
        Ok(())
    }

    fn start_audio(&self, key: AlarmKey, _sound: &SoundDescriptor) -> Result<(), SinkError> {
        if self.failing_audio {
            return Err(SinkError::Audio("no output device".into()));
        }
        self.record(SinkCall::StartAudio(key));
        Ok(())
    }

    fn stop_audio(&self, key: AlarmKey) -> Result<(), SinkError> {
        self.record(SinkCall::StopAudio(key));
        Ok(())
    }

    fn start_vibration(&self, key: AlarmKey, _pattern: &[u64]) -> Result<(), SinkError> {
        self.record(SinkCall::StartVibration(key));
        Ok(())
    }

    fn stop_vibration(&self, key: AlarmKey) -> Result<(), SinkError> {
        self.record(SinkCall::StopVibration(key));
        Ok(())
    }
}
