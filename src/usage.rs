use std::collections::VecDeque;

use serde::Serialize;
use sysinfo::{Pid, System};

use crate::error::UsageError;

pub const USAGE_CAPACITY: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub timestamp: i64,
    /// Fraction of one core: 2.0 means two cores fully busy.
    pub cpu: f64,
    pub memory_bytes: u64,
}

/// One CPU/memory reading of a live process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub cpu: f64,
    pub memory_bytes: u64,
}

pub trait UsageProbe: Send {
    fn measure(&mut self, pid: u32) -> Result<Measurement, UsageError>;
}

/// Reads the process table through sysinfo. Keeps its `System` around so CPU
/// usage is computed against the previous refresh.
pub struct SysinfoUsage {
    sys: System,
}

impl SysinfoUsage {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for SysinfoUsage {
    fn measure(&mut self, pid: u32) -> Result<Measurement, UsageError> {
        let sys_pid = Pid::from_u32(pid);
        if !self.sys.refresh_process(sys_pid) {
            return Err(UsageError::ProcessGone(pid));
        }
        let process = self.sys.process(sys_pid).ok_or(UsageError::ProcessGone(pid))?;
        Ok(Measurement {
            cpu: process.cpu_usage() as f64 / 100.0,
            memory_bytes: process.memory(),
        })
    }
}

/// Bounded timeline of usage samples for one server.
pub struct UsageSampler {
    probe: Box<dyn UsageProbe>,
    samples: VecDeque<UsageSample>,
}

impl UsageSampler {
    pub fn new(probe: Box<dyn UsageProbe>) -> Self {
        Self {
            probe,
            samples: VecDeque::with_capacity(USAGE_CAPACITY + 1),
        }
    }

    /// Records exactly one sample for `timestamp`. A missing process or a
    /// failed measurement is recorded as zero so the timeline stays dense.
    pub fn sample(&mut self, timestamp: i64, pid: Option<u32>) {
        let measurement = match pid {
            Some(pid) => match self.probe.measure(pid) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("couldn't retrieve resource usage for pid {}: {}", pid, e);
                    Measurement {
                        cpu: 0.0,
                        memory_bytes: 0,
                    }
                }
            },
            None => Measurement {
                cpu: 0.0,
                memory_bytes: 0,
            },
        };
        self.push(UsageSample {
            timestamp,
            cpu: measurement.cpu,
            memory_bytes: measurement.memory_bytes,
        });
    }

    pub fn push(&mut self, sample: UsageSample) {
        self.samples.push_back(sample);
        if self.samples.len() > USAGE_CAPACITY {
            self.samples.pop_front();
        }
    }

    pub fn samples(&self) -> Vec<UsageSample> {
        self.samples.iter().copied().collect()
    }
}
