//! Contracts for the external sensor collaborators.
//!
//! Detection models, camera and microphone access are black boxes to the
//! engine. Each is a trait object so hosts can plug in real devices and tests
//! can plug in scripted fakes. Failures are plain strings, as they only ever
//! get logged.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// An encoded still image taken from the video source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPrediction {
    pub label: String,
    pub confidence: f32,
}

/// Discrete focus/visibility notifications from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusNotification {
    FocusLost,
    FocusGained,
    VisibilityHidden,
    VisibilityVisible,
}

impl FocusNotification {
    /// Whether the notification means the exam window is no longer in front.
    pub fn is_loss(&self) -> bool {
        matches!(
            self,
            FocusNotification::FocusLost | FocusNotification::VisibilityHidden
        )
    }

    pub fn reason(&self) -> &'static str {
        match self {
            FocusNotification::FocusLost => "window_blur",
            FocusNotification::FocusGained => "window_focus",
            FocusNotification::VisibilityHidden => "visibility_hidden",
            FocusNotification::VisibilityVisible => "visibility_visible",
        }
    }
}

pub trait FrameSource: Send + Sync {
    /// Most recent frame, or `None` when the camera has nothing to offer.
    fn current_frame(&self) -> Option<Frame>;
}

pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceRegion>, String>;
}

pub trait ObjectDetector: Send + Sync {
    fn detect_objects(&self, frame: &Frame) -> Result<Vec<ObjectPrediction>, String>;
}

pub trait AudioSampler: Send + Sync {
    /// Current RMS energy of the microphone signal.
    fn current_energy(&self) -> Result<f32, String>;
}

pub trait AudioRecorder: Send + Sync {
    /// Encoded audio recorded since the previous call, if any.
    fn take_chunk(&self) -> Result<Option<Vec<u8>>, String>;
}

/// The set of collaborators available for one session.
#[derive(Clone)]
pub struct Sensors {
    pub frames: Arc<dyn FrameSource>,
    pub faces: Arc<dyn FaceDetector>,
    pub objects: Option<Arc<dyn ObjectDetector>>,
    pub audio: Option<Arc<dyn AudioSampler>>,
    pub recorder: Option<Arc<dyn AudioRecorder>>,
}

/// Grants exclusive access to camera and microphone for a session.
///
/// `acquire` failing is fatal to session start. `release` is called exactly
/// once for every successful `acquire`.
pub trait MediaProvider: Send + Sync {
    fn acquire(&self) -> Result<Sensors, String>;
    fn release(&self);
}
