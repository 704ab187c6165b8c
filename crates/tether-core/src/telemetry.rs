use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tether_common::{Result, TetherError};
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::hub::{BroadcastReport, Hub};
use crate::protocol::Envelope;

/// Message type of telemetry pushes
pub const SYSTEM_STATS: &str = "system_stats";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    /// Overall utilization in percent, as a one-element list
    pub usage: Vec<f64>,
    pub per_core: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub timestamp: i64,
}

/// Source of host statistics
#[async_trait]
pub trait StatsSampler: Send + Sync {
    async fn sample(&mut self) -> Result<SystemStats>;
}

/// Samples the local host through `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the sampler is kept
/// alive across ticks; the very first sample may read zero.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatsSampler for SysinfoSampler {
    async fn sample(&mut self) -> Result<SystemStats> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(TetherError::Telemetry("memory statistics unavailable".to_string()));
        }
        let used = self.system.used_memory();

        Ok(SystemStats {
            cpu: CpuStats {
                usage: vec![self.system.global_cpu_info().cpu_usage() as f64],
                per_core: self.system.cpus().iter().map(|c| c.cpu_usage() as f64).collect(),
            },
            memory: MemoryStats {
                total,
                used,
                free: self.system.free_memory(),
                used_percent: used as f64 / total as f64 * 100.0,
            },
            timestamp: unix_now(),
        })
    }
}

/// Periodically samples the host and broadcasts into the [`Hub`]
pub struct TelemetryProducer<S> {
    sampler: S,
    hub: Arc<Hub>,
    interval: Duration,
}

impl<S: StatsSampler + 'static> TelemetryProducer<S> {
    pub fn new(sampler: S, hub: Arc<Hub>, interval: Duration) -> Self {
        Self {
            sampler,
            hub,
            interval,
        }
    }

    /// Sample once and broadcast the snapshot
    pub async fn tick(&mut self) -> Result<BroadcastReport> {
        let stats = self.sampler.sample().await?;
        let envelope = Envelope {
            kind: SYSTEM_STATS.to_string(),
            timestamp: stats.timestamp,
            data: stats,
        };
        let message = serde_json::to_vec(&envelope)
            .map_err(|e| TetherError::Protocol(format!("failed to encode snapshot: {}", e)))?;

        Ok(self.hub.broadcast(Bytes::from(message)).await)
    }

    /// Tick until `shutdown` fires. A failed sample only skips that tick.
    #[instrument(skip_all, fields(interval = ?self.interval))]
    pub async fn run(mut self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticks = IntervalStream::new(tokio::time::interval_at(start, self.interval));
        info!("Telemetry producer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    match self.tick().await {
                        Ok(report) => debug!(delivered = report.delivered, dropped = report.dropped, "Published snapshot"),
                        Err(e) => warn!("Skipping telemetry tick: {}", e),
                    }
                }
            }
        }

        info!("Telemetry producer stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Seconds since the unix epoch
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use std::collections::VecDeque;
    use tether_common::memory::duplex;
    use tether_common::Frame;
    use tokio::time::timeout;

    struct ScriptedSampler {
        samples: VecDeque<Result<SystemStats>>,
    }

    #[async_trait]
    impl StatsSampler for ScriptedSampler {
        async fn sample(&mut self) -> Result<SystemStats> {
            self.samples
                .pop_front()
                .unwrap_or_else(|| Err(TetherError::Telemetry("script exhausted".to_string())))
        }
    }

    fn stats(timestamp: i64) -> SystemStats {
        SystemStats {
            cpu: CpuStats {
                usage: vec![12.5],
                per_core: vec![10.0, 15.0],
            },
            memory: MemoryStats {
                total: 1000,
                used: 250,
                free: 750,
                used_percent: 25.0,
            },
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_tick_wraps_snapshot() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let (conn, mut peer) = duplex(8);
        hub.register(conn).await;

        let sampler = ScriptedSampler {
            samples: VecDeque::from([Ok(stats(1_700_000_000))]),
        };
        let mut producer = TelemetryProducer::new(sampler, hub, Duration::from_secs(2));
        let report = producer.tick().await.unwrap();
        assert_eq!(report.delivered, 1);

        let Some(Frame::Text(text)) = timeout(Duration::from_secs(1), peer.recv()).await.unwrap() else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], SYSTEM_STATS);
        assert_eq!(value["timestamp"], 1_700_000_000);
        assert_eq!(value["data"]["memory"]["usedPercent"], 25.0);
        assert_eq!(value["data"]["cpu"]["usage"][0], 12.5);
    }

    #[tokio::test]
    async fn test_failed_sample_is_skipped() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let (conn, mut peer) = duplex(8);
        hub.register(conn).await;

        let sampler = ScriptedSampler {
            samples: VecDeque::from([
                Err(TetherError::Telemetry("boom".to_string())),
                Ok(stats(7)),
            ]),
        };
        let shutdown = CancellationToken::new();
        let handle = TelemetryProducer::new(sampler, hub, Duration::from_millis(20)).spawn(shutdown.clone());

        let Some(Frame::Text(text)) = timeout(Duration::from_secs(2), peer.recv()).await.unwrap() else {
            panic!("expected a text frame");
        };
        let envelope: Envelope<SystemStats> = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.timestamp, 7);
        assert_eq!(envelope.data, stats(7));

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sysinfo_sampler_reports_memory() {
        let mut sampler = SysinfoSampler::new();
        let snapshot = sampler.sample().await.unwrap();
        assert!(snapshot.memory.total > 0);
        assert!(snapshot.memory.used <= snapshot.memory.total);
        assert!((0.0..=100.0).contains(&snapshot.memory.used_percent));
        assert_eq!(snapshot.cpu.usage.len(), 1);
        assert!(snapshot.timestamp > 0);
    }
}
