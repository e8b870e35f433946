//! Scripted sensor timelines for offline replays.
//!
//! A timeline is a JSON document of observations keyed by milliseconds from
//! session start. Each observation holds until the next one on the same
//! track, so a face count of 0 at 2000 and 1 at 9000 means "no face for
//! seven seconds".

use proctor_engine::{
    AudioSampler, BoundingBox, FaceDetector, FaceRegion, FocusNotification, Frame, FrameSource,
    MediaProvider, ObjectDetector, ObjectPrediction, Sensors,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const DEFAULT_FACE_CONFIDENCE: f32 = 0.9;
// JPEG SOI + APP0 marker; enough for evidence capture to have bytes to ship.
const FRAME_BYTES: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeline {
    pub duration_ms: u64,
    #[serde(default)]
    pub frames: Vec<FrameObservation>,
    /// Leave empty to replay without a microphone.
    #[serde(default)]
    pub audio: Vec<AudioObservation>,
    #[serde(default)]
    pub focus: Vec<FocusEvent>,
    #[serde(default)]
    pub manual_tests: Vec<ManualTest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameObservation {
    pub at_ms: u64,
    pub faces: u32,
    pub face_confidence: Option<f32>,
    pub objects: Vec<ObjectObservation>,
    /// Camera delivered nothing at this point.
    pub no_frame: bool,
    pub fail_faces: bool,
    pub fail_objects: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectObservation {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioObservation {
    pub at_ms: u64,
    pub rms: f32,
    #[serde(default)]
    pub fail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusKind {
    FocusLost,
    FocusGained,
    VisibilityHidden,
    VisibilityVisible,
}

impl From<FocusKind> for FocusNotification {
    fn from(kind: FocusKind) -> Self {
        match kind {
            FocusKind::FocusLost => FocusNotification::FocusLost,
            FocusKind::FocusGained => FocusNotification::FocusGained,
            FocusKind::VisibilityHidden => FocusNotification::VisibilityHidden,
            FocusKind::VisibilityVisible => FocusNotification::VisibilityVisible,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FocusEvent {
    pub at_ms: u64,
    pub event: FocusKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualTest {
    pub at_ms: u64,
    #[serde(default)]
    pub details: Option<String>,
}

impl Timeline {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs_err::read_to_string(path)
            .map_err(|err| format!("Failed to read timeline {}: {}", path.display(), err))?;
        Self::parse(&content)
            .map_err(|err| format!("Invalid timeline {}: {}", path.display(), err))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let mut timeline: Timeline = serde_json::from_str(content).map_err(|err| err.to_string())?;
        if timeline.duration_ms == 0 {
            return Err("duration_ms must be greater than zero".to_string());
        }
        timeline.frames.sort_by_key(|obs| obs.at_ms);
        timeline.audio.sort_by_key(|obs| obs.at_ms);
        timeline.focus.sort_by_key(|event| event.at_ms);
        timeline.manual_tests.sort_by_key(|test| test.at_ms);
        Ok(timeline)
    }

    /// Visual observation in effect at `at_ms`. Before the first entry the
    /// camera sees a single face.
    pub fn frame_at(&self, at_ms: u64) -> FrameObservation {
        self.frames
            .iter()
            .take_while(|obs| obs.at_ms <= at_ms)
            .last()
            .cloned()
            .unwrap_or(FrameObservation {
                faces: 1,
                ..FrameObservation::default()
            })
    }

    /// Audio observation in effect at `at_ms`. Silence before the first entry.
    pub fn audio_at(&self, at_ms: u64) -> Option<AudioObservation> {
        self.audio
            .iter()
            .take_while(|obs| obs.at_ms <= at_ms)
            .last()
            .cloned()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }
}

/// Sensors whose readings are set by the replay loop before each tick.
pub struct ScriptedSensors {
    frame: Mutex<FrameObservation>,
    audio: Mutex<Option<AudioObservation>>,
}

impl ScriptedSensors {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(FrameObservation {
                faces: 1,
                ..FrameObservation::default()
            }),
            audio: Mutex::new(None),
        }
    }

    pub fn set_frame(&self, observation: FrameObservation) {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = observation;
    }

    pub fn set_audio(&self, observation: Option<AudioObservation>) {
        *self.audio.lock().unwrap_or_else(PoisonError::into_inner) = observation;
    }

    fn frame(&self) -> FrameObservation {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ScriptedSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for ScriptedSensors {
    fn current_frame(&self) -> Option<Frame> {
        if self.frame().no_frame {
            return None;
        }
        Some(Frame::new(FRAME_BYTES.to_vec(), 640, 480))
    }
}

impl FaceDetector for ScriptedSensors {
    fn detect_faces(&self, _frame: &Frame) -> Result<Vec<FaceRegion>, String> {
        let observation = self.frame();
        if observation.fail_faces {
            return Err("scripted face detector failure".to_string());
        }
        let confidence = observation
            .face_confidence
            .unwrap_or(DEFAULT_FACE_CONFIDENCE);
        Ok((0..observation.faces)
            .map(|index| FaceRegion {
                bounding_box: BoundingBox {
                    x: 40.0 + index as f32 * 160.0,
                    y: 60.0,
                    width: 140.0,
                    height: 160.0,
                },
                confidence,
            })
            .collect())
    }
}

impl ObjectDetector for ScriptedSensors {
    fn detect_objects(&self, _frame: &Frame) -> Result<Vec<ObjectPrediction>, String> {
        let observation = self.frame();
        if observation.fail_objects {
            return Err("scripted object detector failure".to_string());
        }
        Ok(observation
            .objects
            .iter()
            .map(|object| ObjectPrediction {
                label: object.label.clone(),
                confidence: object.confidence,
            })
            .collect())
    }
}

impl AudioSampler for ScriptedSensors {
    fn current_energy(&self) -> Result<f32, String> {
        match &*self.audio.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(observation) if observation.fail => {
                Err("scripted microphone failure".to_string())
            }
            Some(observation) => Ok(observation.rms),
            None => Ok(0.0),
        }
    }
}

/// Hands the scripted sensors to the engine on `acquire`.
pub struct ReplayMedia {
    sensors: Arc<ScriptedSensors>,
    with_audio: bool,
    acquired: AtomicBool,
}

impl ReplayMedia {
    pub fn new(sensors: Arc<ScriptedSensors>, with_audio: bool) -> Self {
        Self {
            sensors,
            with_audio,
            acquired: AtomicBool::new(false),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl MediaProvider for ReplayMedia {
    fn acquire(&self) -> Result<Sensors, String> {
        self.acquired.store(true, Ordering::SeqCst);
        let audio: Option<Arc<dyn AudioSampler>> = if self.with_audio {
            Some(self.sensors.clone())
        } else {
            None
        };
        Ok(Sensors {
            frames: self.sensors.clone(),
            faces: self.sensors.clone(),
            objects: Some(self.sensors.clone()),
            audio,
            recorder: None,
        })
    }

    fn release(&self) {
        self.acquired.store(false, Ordering::SeqCst);
    }
}
