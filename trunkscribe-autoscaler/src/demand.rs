/// Derived capacity target for one cycle. Never persisted and never fed back
/// into the next cycle; it is a pure function of the configured bounds and
/// the live demand signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetTarget {
    pub min_instances: u32,
    pub max_instances: u32,
    pub desired_instances: u32,
}

impl FleetTarget {
    /// Steady-fleet mode: `min == max` pins the fleet size with no demand
    /// estimation at all, so operators can run a fixed fleet even when the
    /// health collaborator is down.
    pub fn steady(size: u32) -> Self {
        Self {
            min_instances: size,
            max_instances: size,
            desired_instances: size,
        }
    }

    /// `desired = clamp(ceil(backlog / throughput), min, max)`.
    ///
    /// Fractional results round up: under-provisioning stalls the queue,
    /// over-provisioning only costs money.
    pub fn from_backlog(min: u32, max: u32, backlog: u64, throughput: u32) -> Self {
        let throughput = u64::from(throughput.max(1));
        let raw = backlog.div_ceil(throughput);
        let desired = u32::try_from(raw).unwrap_or(u32::MAX).clamp(min, max);
        Self {
            min_instances: min,
            max_instances: max,
            desired_instances: desired,
        }
    }

    /// Demand-signal-free target used by the health fallbacks: hold the
    /// currently visible capacity, clamped to the configured bounds.
    pub fn hold(min: u32, max: u32, current: u32) -> Self {
        Self {
            min_instances: min,
            max_instances: max,
            desired_instances: current.clamp(min, max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_bounds_for_all_backlogs() {
        for backlog in [0u64, 1, 19, 20, 21, 199, 200, 10_000, u64::MAX] {
            let target = FleetTarget::from_backlog(1, 10, backlog, 20);
            assert!(target.desired_instances >= 1, "backlog={}", backlog);
            assert!(target.desired_instances <= 10, "backlog={}", backlog);
        }
    }

    #[test]
    fn idempotent_for_fixed_inputs() {
        let a = FleetTarget::from_backlog(1, 10, 90, 20);
        let b = FleetTarget::from_backlog(1, 10, 90, 20);
        assert_eq!(a, b);
    }

    #[test]
    fn fractional_results_round_up() {
        // 90 queued calls / 20 per worker = 4.5 -> 5 workers
        assert_eq!(
            FleetTarget::from_backlog(1, 10, 90, 20).desired_instances,
            5
        );
        // Exact division does not over-provision.
        assert_eq!(
            FleetTarget::from_backlog(1, 10, 80, 20).desired_instances,
            4
        );
    }

    #[test]
    fn empty_backlog_sits_at_min() {
        assert_eq!(FleetTarget::from_backlog(2, 10, 0, 20).desired_instances, 2);
    }

    #[test]
    fn steady_fleet_is_constant() {
        assert_eq!(FleetTarget::steady(3).desired_instances, 3);
    }

    #[test]
    fn hold_clamps_current_capacity() {
        assert_eq!(FleetTarget::hold(2, 5, 0).desired_instances, 2);
        assert_eq!(FleetTarget::hold(2, 5, 4).desired_instances, 4);
        assert_eq!(FleetTarget::hold(2, 5, 9).desired_instances, 5);
    }
}
