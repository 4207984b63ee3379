//! Observed network quality and the prefetch tuning it implies.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

const SAMPLE_WINDOW: usize = 10;
const MIN_SAMPLE_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_BANDWIDTH_KIBPS: f64 = 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Wifi,
    FiveG,
    FourG,
    Slow,
    Offline,
}

/// Tuning knobs for the prefetch scheduler at a given network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchConfig {
    pub ahead: usize,
    pub behind: usize,
    pub keep: usize,
    pub max_concurrent: usize,
}

impl NetworkType {
    fn prefetch_config(self) -> PrefetchConfig {
        match self {
            NetworkType::Wifi => PrefetchConfig { ahead: 4, behind: 2, keep: 8, max_concurrent: 4 },
            NetworkType::FiveG => PrefetchConfig { ahead: 3, behind: 1, keep: 6, max_concurrent: 3 },
            NetworkType::FourG => PrefetchConfig { ahead: 2, behind: 1, keep: 4, max_concurrent: 2 },
            NetworkType::Slow => PrefetchConfig { ahead: 1, behind: 0, keep: 3, max_concurrent: 1 },
            NetworkType::Offline => PrefetchConfig { ahead: 0, behind: 0, keep: 2, max_concurrent: 0 },
        }
    }
}

/// Reported connectivity state, as a caller (typically a platform bridge)
/// would observe it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Connectivity {
    pub is_wifi: Option<bool>,
    pub is_mobile: Option<bool>,
}

struct State {
    class: NetworkType,
    bandwidth_kibps: f64,
    samples: VecDeque<f64>,
}

/// Tracks observed download throughput and exposes the prefetch tuning
/// that follows from it. Cheap to lock: every method is a handful of
/// arithmetic operations over a small ring buffer.
pub struct NetworkQualityMonitor {
    state: Mutex<State>,
}

impl Default for NetworkQualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkQualityMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                class: NetworkType::FourG,
                bandwidth_kibps: DEFAULT_BANDWIDTH_KIBPS,
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            }),
        }
    }

    /// Records a completed transfer of `bytes` over `duration`. Ignored if
    /// `duration` is under 100 ms (too noisy to be informative).
    pub fn record_sample(&self, bytes: u64, duration: Duration) {
        if duration < MIN_SAMPLE_DURATION {
            return;
        }
        let kibps = (bytes as f64 / 1024.0) / duration.as_secs_f64();

        let mut state = self.state.lock();
        if state.samples.len() >= SAMPLE_WINDOW {
            state.samples.pop_front();
        }
        state.samples.push_back(kibps);
        state.bandwidth_kibps = state.samples.iter().sum::<f64>() / state.samples.len() as f64;

        if state.class != NetworkType::Wifi {
            state.class = if state.bandwidth_kibps > 2048.0 {
                NetworkType::FiveG
            } else if state.bandwidth_kibps > 512.0 {
                NetworkType::FourG
            } else {
                NetworkType::Slow
            };
        }
    }

    /// Applies a connectivity change, clearing accumulated samples (they
    /// no longer describe the current link).
    pub fn update_from_connectivity(&self, connectivity: Connectivity) {
        let mut state = self.state.lock();
        state.class = match (connectivity.is_wifi, connectivity.is_mobile) {
            (Some(true), _) => NetworkType::Wifi,
            (_, Some(true)) => NetworkType::FourG,
            (Some(false), Some(false)) => NetworkType::Offline,
            _ => state.class,
        };
        state.samples.clear();
        state.bandwidth_kibps = DEFAULT_BANDWIDTH_KIBPS;
    }

    pub fn current_class(&self) -> NetworkType {
        self.state.lock().class
    }

    /// Directly sets the network class (e.g. from an explicit caller
    /// override rather than an observed connectivity event). Samples are
    /// left intact since this isn't a detected transition.
    pub fn set_class(&self, class: NetworkType) {
        self.state.lock().class = class;
    }

    pub fn bandwidth_kibps(&self) -> f64 {
        self.state.lock().bandwidth_kibps
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        self.state.lock().class.prefetch_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_samples_are_ignored() {
        let monitor = NetworkQualityMonitor::new();
        monitor.record_sample(1_000_000, Duration::from_millis(50));
        assert_eq!(monitor.bandwidth_kibps(), DEFAULT_BANDWIDTH_KIBPS);
    }

    #[test]
    fn high_throughput_reclassifies_to_five_g() {
        let monitor = NetworkQualityMonitor::new();
        // 4 MiB over 1s = 4096 KiB/s, well above the 2048 KiB/s five-g cutoff.
        monitor.record_sample(4 * 1024 * 1024, Duration::from_secs(1));
        assert_eq!(monitor.current_class(), NetworkType::FiveG);
    }

    #[test]
    fn wifi_classification_is_sticky_against_samples() {
        let monitor = NetworkQualityMonitor::new();
        monitor.update_from_connectivity(Connectivity { is_wifi: Some(true), is_mobile: None });
        monitor.record_sample(1024, Duration::from_secs(1)); // 1 KiB/s, "slow" if reclassified
        assert_eq!(monitor.current_class(), NetworkType::Wifi);
    }

    #[test]
    fn connectivity_change_clears_samples() {
        let monitor = NetworkQualityMonitor::new();
        monitor.record_sample(4 * 1024 * 1024, Duration::from_secs(1));
        assert_eq!(monitor.current_class(), NetworkType::FiveG);
        monitor.update_from_connectivity(Connectivity { is_wifi: None, is_mobile: Some(false) });
        assert_eq!(monitor.bandwidth_kibps(), DEFAULT_BANDWIDTH_KIBPS);
    }

    #[test]
    fn prefetch_config_matches_spec_table() {
        let monitor = NetworkQualityMonitor::new();
        monitor.update_from_connectivity(Connectivity { is_wifi: Some(true), is_mobile: None });
        let wifi = monitor.prefetch_config();
        assert_eq!(wifi, PrefetchConfig { ahead: 4, behind: 2, keep: 8, max_concurrent: 4 });

        monitor.update_from_connectivity(Connectivity { is_wifi: Some(false), is_mobile: Some(false) });
        let offline = monitor.prefetch_config();
        assert_eq!(offline, PrefetchConfig { ahead: 0, behind: 0, keep: 2, max_concurrent: 0 });
    }
}
