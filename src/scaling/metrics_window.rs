//! Rolling per-component metric window. Samples older than the window (or
//! beyond the sample cap) are dropped on every push and read.

use super::types::{MetricKind, ScalingMetrics};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct MetricsWindow {
    window: Duration,
    max_samples: usize,
    samples: VecDeque<(Instant, ScalingMetrics)>,
}

impl MetricsWindow {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            window,
            max_samples: max_samples.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, metrics: ScalingMetrics) {
        self.samples.push_back((Instant::now(), metrics));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        self.prune();
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of samples still inside the window
    pub fn len(&mut self) -> usize {
        self.prune();
        self.samples.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn latest(&mut self) -> Option<ScalingMetrics> {
        self.prune();
        self.samples.back().map(|(_, m)| m.clone())
    }

    /// Mean of one metric over the window
    pub fn aggregate(&mut self, kind: MetricKind) -> Option<f64> {
        self.prune();
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|(_, m)| kind.value_of(m)).sum();
        Some(total / self.samples.len() as f64)
    }

    /// Field-wise mean over the window, stamped with the latest sample time
    pub fn average(&mut self) -> Option<ScalingMetrics> {
        self.prune();
        let count = self.samples.len();
        let (_, last) = self.samples.back()?;
        let timestamp = last.timestamp;
        let n = count as f64;
        let mean = |f: fn(&ScalingMetrics) -> f64| {
            self.samples.iter().map(|(_, m)| f(m)).sum::<f64>() / n
        };

        Some(ScalingMetrics {
            cpu: mean(|m| m.cpu),
            memory: mean(|m| m.memory),
            request_rate: mean(|m| m.request_rate),
            response_time_ms: mean(|m| m.response_time_ms),
            error_rate: mean(|m| m.error_rate),
            active_connections: mean(|m| m.active_connections as f64).round() as u64,
            queue_length: mean(|m| m.queue_length as f64).round() as u64,
            instance_id: None,
            timestamp,
        })
    }
}
