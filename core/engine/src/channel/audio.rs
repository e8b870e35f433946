//! Audio-activity channel.
//!
//! Confirmation is count based: `required_consecutive` samples above the RMS
//! threshold, taken at the fixed audio cadence. Any sample at or below the
//! threshold (or a failed sample) restarts the count.

use super::{ChannelState, Transition};
use crate::config::AudioConfig;
use proctor_daemon_protocol::AlertKind;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AudioChannel {
    threshold: f32,
    required: u32,
    cooldown: Duration,
    consecutive: u32,
    cooldown_until: Option<Instant>,
}

impl AudioChannel {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            threshold: config.rms_threshold,
            required: config.required_consecutive.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            consecutive: 0,
            cooldown_until: None,
        }
    }

    pub fn observe(&mut self, energy: Option<f32>, now: Instant) -> Option<Transition> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
            self.cooldown_until = None;
            self.consecutive = 0;
        }

        let rms = match energy {
            Some(rms) if rms > self.threshold => rms,
            _ => {
                self.consecutive = 0;
                return None;
            }
        };

        self.consecutive += 1;
        if self.consecutive < self.required {
            return None;
        }

        self.consecutive = 0;
        self.cooldown_until = Some(now + self.cooldown);
        Some(Transition::new(
            AlertKind::AudioActivity,
            format!("rms={:.4}", rms),
        ))
    }

    pub fn state(&self) -> ChannelState {
        if self.cooldown_until.is_some() {
            ChannelState::Confirmed
        } else if self.consecutive > 0 {
            ChannelState::Pending
        } else {
            ChannelState::Idle
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(channel: &mut AudioChannel, t0: Instant, values: &[f32]) -> Vec<u64> {
        values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| {
                let at = index as u64 * 200;
                channel
                    .observe(Some(*value), t0 + Duration::from_millis(at))
                    .map(|_| at)
            })
            .collect()
    }

    #[test]
    fn alternating_energy_never_confirms() {
        let t0 = Instant::now();
        let mut channel = AudioChannel::new(&AudioConfig::default());
        let values: Vec<f32> = (0..30)
            .map(|index| if index % 2 == 0 { 0.2 } else { 0.01 })
            .collect();
        assert!(samples(&mut channel, t0, &values).is_empty());
    }

    #[test]
    fn three_consecutive_samples_confirm_once() {
        let t0 = Instant::now();
        let mut channel = AudioChannel::new(&AudioConfig::default());
        let fired = samples(&mut channel, t0, &[0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(fired, vec![400]);
        assert_eq!(channel.state(), ChannelState::Confirmed);
    }

    #[test]
    fn sustained_noise_realerts_after_cooldown() {
        let t0 = Instant::now();
        let mut channel = AudioChannel::new(&AudioConfig::default());
        let values = vec![0.3; 60];
        let fired = samples(&mut channel, t0, &values);
        assert_eq!(fired, vec![400, 10_800]);
    }

    #[test]
    fn failed_sample_breaks_the_run() {
        let t0 = Instant::now();
        let mut channel = AudioChannel::new(&AudioConfig::default());
        assert!(channel.observe(Some(0.2), t0).is_none());
        assert!(channel
            .observe(Some(0.2), t0 + Duration::from_millis(200))
            .is_none());
        assert!(channel.observe(None, t0 + Duration::from_millis(400)).is_none());
        assert_eq!(channel.consecutive(), 0);
        assert!(channel
            .observe(Some(0.2), t0 + Duration::from_millis(600))
            .is_none());
    }

    #[test]
    fn threshold_is_exclusive() {
        let t0 = Instant::now();
        let mut channel = AudioChannel::new(&AudioConfig::default());
        let fired = samples(&mut channel, t0, &[0.06, 0.06, 0.06, 0.06]);
        assert!(fired.is_empty());
    }
}
