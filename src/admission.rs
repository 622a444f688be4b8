use tracing::error;

use crate::engine::{MppControl, MppControlReply, MppEngine};

/// Compressed packets allowed inside the engine at once.
pub const INPUT_MAX_PACKETS: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub last_in_flight: u32,
    pub peak_in_flight: u32,
    pub denied: u64,
    pub query_failures: u64,
}

/// Gates packet submission on the engine's own in-flight count.
///
/// The count is queried on every decision and never cached.
#[derive(Debug)]
pub(crate) struct Admission {
    limit: u32,
    stats: AdmissionStats,
}

impl Admission {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            stats: AdmissionStats::default(),
        }
    }

    /// `None` when the engine cannot report its count.
    pub(crate) fn in_flight(&mut self, engine: &mut dyn MppEngine) -> Option<u32> {
        match engine.control(MppControl::GetStreamCount) {
            Ok(MppControlReply::StreamCount(count)) => {
                self.stats.last_in_flight = count;
                self.stats.peak_in_flight = self.stats.peak_in_flight.max(count);
                Some(count)
            }
            Ok(reply) => {
                error!(?reply, "unexpected reply to stream count query");
                self.stats.query_failures += 1;
                None
            }
            Err(err) => {
                error!(%err, "failed to get decoder used slots");
                self.stats.query_failures += 1;
                None
            }
        }
    }

    /// Admits when the count is below the limit, and also when the count
    /// cannot be queried at all.
    pub(crate) fn can_submit(&mut self, engine: &mut dyn MppEngine) -> bool {
        let admitted = self
            .in_flight(engine)
            .is_none_or(|count| count < self.limit);
        if !admitted {
            self.stats.denied += 1;
        }
        admitted
    }

    /// Whether the engine still holds undecoded packets.
    pub(crate) fn has_pending(&mut self, engine: &mut dyn MppEngine) -> bool {
        self.in_flight(engine).is_some_and(|count| count > 0)
    }

    pub(crate) fn stats(&self) -> AdmissionStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MppPacket;
    use crate::sim::{SimConfig, SimUnit, SimulatedEngine};

    #[test]
    fn admission_closes_at_limit() {
        let (mut engine, _probe) = SimulatedEngine::new(SimConfig::default());
        let mut admission = Admission::new(INPUT_MAX_PACKETS);
        let data = SimUnit::Frame.encode();

        let mut submitted = 0;
        while admission.can_submit(&mut engine) {
            engine.put_packet(&MppPacket::new(&data, submitted)).unwrap();
            submitted += 1;
        }
        assert_eq!(submitted, i64::from(INPUT_MAX_PACKETS));
        let stats = admission.stats();
        assert_eq!(stats.peak_in_flight, INPUT_MAX_PACKETS);
        assert_eq!(stats.denied, 1);
    }

    #[test]
    fn failed_query_favors_admission() {
        let (mut engine, probe) = SimulatedEngine::new(SimConfig::default());
        probe.set_fail_stream_count(true);
        let mut admission = Admission::new(INPUT_MAX_PACKETS);

        assert!(admission.can_submit(&mut engine));
        assert!(!admission.has_pending(&mut engine));
        assert_eq!(admission.stats().query_failures, 2);
    }

    #[test]
    fn pending_tracks_engine_queue() {
        let (mut engine, _probe) = SimulatedEngine::new(SimConfig::default());
        let mut admission = Admission::new(INPUT_MAX_PACKETS);
        assert!(!admission.has_pending(&mut engine));
        engine
            .put_packet(&MppPacket::new(&SimUnit::Frame.encode(), 0))
            .unwrap();
        assert!(admission.has_pending(&mut engine));
        assert_eq!(admission.stats().last_in_flight, 1);
    }
}
