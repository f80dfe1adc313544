//! Prometheus text exposition format.
//!
//! Renders fleet gauges into the Prometheus text exposition format for
//! scraping by a Prometheus server or compatible agent.

use fleet_state::{FleetSnapshot, InstanceId, InstanceState};

use crate::aggregator::Aggregate;

/// Point-in-time values exposed on `/metrics`.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetGauges {
    pub snapshot_version: u64,
    pub instances_by_state: Vec<(InstanceState, usize)>,
    pub routable: usize,
    pub windowed_cpu: Aggregate,
    pub in_flight: Vec<(InstanceId, usize)>,
}

impl FleetGauges {
    pub fn new(
        snapshot: &FleetSnapshot,
        routable: usize,
        windowed_cpu: Aggregate,
        in_flight: Vec<(InstanceId, usize)>,
    ) -> Self {
        Self {
            snapshot_version: snapshot.version,
            instances_by_state: InstanceState::ALL
                .iter()
                .map(|s| (*s, snapshot.count_in_state(*s)))
                .collect(),
            routable,
            windowed_cpu,
            in_flight,
        }
    }
}

/// Render fleet gauges into Prometheus text format.
pub fn render_prometheus(gauges: &FleetGauges) -> String {
    let mut out = String::new();

    out.push_str("# HELP fleet_instances Registered instances by lifecycle state.\n");
    out.push_str("# TYPE fleet_instances gauge\n");
    for (state, count) in &gauges.instances_by_state {
        out.push_str(&format!(
            "fleet_instances{{state=\"{}\"}} {}\n",
            state.as_str(),
            count
        ));
    }

    out.push_str("# HELP fleet_routable_instances Instances currently receiving new traffic.\n");
    out.push_str("# TYPE fleet_routable_instances gauge\n");
    out.push_str(&format!("fleet_routable_instances {}\n", gauges.routable));

    out.push_str("# HELP fleet_windowed_cpu Mean CPU utilization over the scaling window.\n");
    out.push_str("# TYPE fleet_windowed_cpu gauge\n");
    match gauges.windowed_cpu {
        Aggregate::Value(v) => out.push_str(&format!("fleet_windowed_cpu {v:.4}\n")),
        Aggregate::Unknown => out.push_str("fleet_windowed_cpu NaN\n"),
    }

    out.push_str("# HELP fleet_instance_in_flight Open routed connections per instance.\n");
    out.push_str("# TYPE fleet_instance_in_flight gauge\n");
    for (id, count) in &gauges.in_flight {
        out.push_str(&format!(
            "fleet_instance_in_flight{{instance=\"{id}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP fleet_snapshot_version Version of the latest registry snapshot.\n");
    out.push_str("# TYPE fleet_snapshot_version counter\n");
    out.push_str(&format!("fleet_snapshot_version {}\n", gauges.snapshot_version));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauges(cpu: Aggregate) -> FleetGauges {
        FleetGauges {
            snapshot_version: 7,
            instances_by_state: vec![
                (InstanceState::Pending, 1),
                (InstanceState::InService, 3),
            ],
            routable: 3,
            windowed_cpu: cpu,
            in_flight: vec![("i-0000000001".to_string(), 4)],
        }
    }

    #[test]
    fn render_fleet_gauges() {
        let output = render_prometheus(&gauges(Aggregate::Value(0.725)));

        assert!(output.contains("fleet_instances{state=\"pending\"} 1"));
        assert!(output.contains("fleet_instances{state=\"in_service\"} 3"));
        assert!(output.contains("fleet_routable_instances 3"));
        assert!(output.contains("fleet_windowed_cpu 0.7250"));
        assert!(output.contains("fleet_instance_in_flight{instance=\"i-0000000001\"} 4"));
        assert!(output.contains("fleet_snapshot_version 7"));
    }

    #[test]
    fn unknown_cpu_renders_nan() {
        let output = render_prometheus(&gauges(Aggregate::Unknown));
        assert!(output.contains("fleet_windowed_cpu NaN"));
    }

    #[test]
    fn gauges_count_every_state() {
        let snapshot = FleetSnapshot::default();
        let g = FleetGauges::new(&snapshot, 0, Aggregate::Unknown, Vec::new());
        assert_eq!(g.instances_by_state.len(), InstanceState::ALL.len());

        let output = render_prometheus(&g);
        assert!(output.contains("fleet_instances{state=\"terminated\"} 0"));
    }

    #[test]
    fn every_family_is_declared() {
        let output = render_prometheus(&gauges(Aggregate::Unknown));
        for line in output.lines().filter(|l| !l.starts_with('#')) {
            let name = line.split(['{', ' ']).next().unwrap();
            assert!(
                output.contains(&format!("# TYPE {name} ")),
                "missing TYPE for {name}"
            );
        }
    }
}
