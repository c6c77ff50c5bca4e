use std::collections::BTreeMap;
use tracing::info;

/// Latency and throughput of one pipeline stage across its runs.
#[derive(Debug, Clone, Default)]
pub struct StageMetrics {
    pub times: Vec<f64>, // seconds per run
    pub items: Vec<usize>, // lines/records handled per run
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    stages: BTreeMap<String, StageMetrics>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: &str, time_sec: f64, items: usize) {
        let entry = self.stages.entry(stage.to_string()).or_default();
        entry.times.push(time_sec);
        entry.items.push(items);
    }

    pub fn stage(&self, stage: &str) -> Option<&StageMetrics> {
        self.stages.get(stage)
    }

    /// Calculate percentile (0-100)
    fn percentile(data: &[f64], p: f64) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let mut sorted = data.to_vec();
        sorted.sort_by(f64::total_cmp);
        let index = ((sorted.len() - 1) as f64 * p / 100.0).ceil() as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    fn average(data: &[f64]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        data.iter().sum::<f64>() / data.len() as f64
    }

    fn items_per_sec(times: &[f64], items: &[usize]) -> Vec<f64> {
        times
            .iter()
            .zip(items.iter())
            .map(|(time, &items)| if *time > 0.0 { items as f64 / *time } else { 0.0 })
            .collect()
    }

    pub fn print_summary(&self) {
        let separator = "=".repeat(80);
        info!("{}", separator);
        info!("PIPELINE METRICS SUMMARY");
        info!("{}", separator);

        if self.stages.is_empty() {
            info!("No stages recorded");
        }
        for (name, stage) in &self.stages {
            let rates = Self::items_per_sec(&stage.times, &stage.items);
            info!("\n{}:", name);
            info!("  Average Latency: {:.3}s", Self::average(&stage.times));
            info!("  P99 Latency:     {:.3}s", Self::percentile(&stage.times, 99.0));
            info!("  Average Speed:   {:.2} items/sec", Self::average(&rates));
            info!("  Runs:            {}", stage.times.len());
            info!("  Total Items:     {}", stage.items.iter().sum::<usize>());
        }

        info!("{}", separator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_stage() {
        let mut metrics = PipelineMetrics::new();
        metrics.record("select", 2.0, 10);
        metrics.record("select", 1.0, 4);
        metrics.record("merge", 0.5, 3);
        let select = metrics.stage("select").unwrap();
        assert_eq!(select.items, vec![10, 4]);
        assert_eq!(PipelineMetrics::average(&select.times), 1.5);
        assert_eq!(PipelineMetrics::items_per_sec(&select.times, &select.items), vec![5.0, 4.0]);
        assert!(metrics.stage("train").is_none());
    }

    #[test]
    fn percentile_takes_upper_rank() {
        let data = [3.0, 1.0, 2.0, 4.0];
        assert_eq!(PipelineMetrics::percentile(&data, 99.0), 4.0);
        assert_eq!(PipelineMetrics::percentile(&data, 50.0), 3.0);
        assert_eq!(PipelineMetrics::percentile(&[], 99.0), 0.0);
    }
}
