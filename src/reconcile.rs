// Reconciliation engine
// Scans the store for coincident observations, learns pairwise clock
// skews, then rewrites every translatable plot into the leader time frame
// and collapses duplicates.

use tracing::debug;

use crate::plotdb::{sort_plots, DronePlot, PlotDb, FLAG_NEWLY_RECEIVED};
use crate::skews::{NodeId, SkewGraph};

/// Two observations within this many seconds may be the same event.
/// Wide enough to absorb residual jitter below the inferred skews.
pub const MAX_TIME_DELTA: i64 = 15;

/// Spatial tolerance for the coincidence predicate, in degrees. Narrow
/// enough to exclude distinct sightings of different events.
pub const COORD_TOLERANCE: f32 = 1e-5;

/// True when two plots look like the same physical event: same drone,
/// temporally near, geographically coincident. Symmetric; ignores node ids
/// and flags.
pub fn coincident(a: &DronePlot, b: &DronePlot) -> bool {
    a.drone_id == b.drone_id
        && (a.timestamp - b.timestamp).abs() <= MAX_TIME_DELTA
        && (a.latitude - b.latitude).abs() <= COORD_TOLERANCE
        && (a.longitude - b.longitude).abs() <= COORD_TOLERANCE
}

/// Drives skew discovery and timestamp normalization over the plot store.
///
/// Reconciliation is total: plots whose node has no known path to the
/// leader are left untouched and picked up on a later pass once more
/// skews are known.
#[derive(Debug, Default)]
pub struct Reconciler {
    skews: SkewGraph,
    leader: Option<NodeId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler {
            skews: SkewGraph::new(),
            leader: None,
        }
    }

    pub fn skews(&self) -> &SkewGraph {
        &self.skews
    }

    /// Leader chosen by the most recent pass, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Run one reconciliation pass. Holds the store lock for the whole
    /// pass, so the pass is atomic with respect to concurrent appends.
    pub fn reconcile(&mut self, db: &PlotDb) {
        let mut plots = db.lock();
        self.reconcile_plots(&mut plots);
    }

    fn reconcile_plots(&mut self, plots: &mut Vec<DronePlot>) {
        self.discover_skews(plots);

        let Some(leader) = plots.iter().map(|p| p.node_id).min() else {
            return;
        };
        self.leader = Some(leader);

        // Translate everything with a known path into the leader frame.
        // Already-translated plots get offset 0; unreachable nodes wait.
        let mut translated = 0usize;
        for plot in plots.iter_mut() {
            if let Some(offset) = self.skews.lookup(plot.node_id, leader) {
                plot.timestamp += offset;
                plot.node_id = leader;
                plot.clear_flags(FLAG_NEWLY_RECEIVED);
                translated += 1;
            }
        }

        sort_plots(plots);

        // Adjacent duplicates collapse: erase the later of each
        // coincident pair and re-test against the successor.
        let before = plots.len();
        let mut i = 0;
        while i + 1 < plots.len() {
            if coincident(&plots[i], &plots[i + 1]) {
                plots.remove(i + 1);
            } else {
                i += 1;
            }
        }

        debug!(
            leader,
            translated,
            deduped = before - plots.len(),
            edges = self.skews.len(),
            "reconciliation pass complete"
        );
    }

    /// Probe every newly received plot against the whole store. A
    /// coincidence across two nodes pins the pairwise clock offset.
    fn discover_skews(&mut self, plots: &[DronePlot]) {
        for probe in plots.iter().filter(|p| p.flag_set(FLAG_NEWLY_RECEIVED)) {
            for other in plots.iter() {
                if other.node_id != probe.node_id && coincident(other, probe) {
                    self.skews.record(
                        probe.node_id,
                        other.node_id,
                        other.timestamp - probe.timestamp,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skews::SkewEdge;

    fn flagged(drone_id: i32, node_id: i32, timestamp: i64, lat: f32, lon: f32) -> DronePlot {
        let mut p = DronePlot::new(drone_id, node_id, timestamp, lat, lon);
        p.set_flags(FLAG_NEWLY_RECEIVED);
        p
    }

    fn db_with(plots: Vec<DronePlot>) -> PlotDb {
        let db = PlotDb::new();
        for p in plots {
            db.push(p);
        }
        db
    }

    #[test]
    fn test_coincidence_predicate() {
        let a = DronePlot::new(7, 2, 1000, 10.0, 20.0);
        let b = DronePlot::new(7, 3, 1015, 10.0, 20.0);
        assert!(coincident(&a, &b));
        assert!(coincident(&b, &a));

        let late = DronePlot::new(7, 3, 1016, 10.0, 20.0);
        assert!(!coincident(&a, &late));

        let far = DronePlot::new(7, 3, 1000, 10.001, 20.0);
        assert!(!coincident(&a, &far));

        let other_drone = DronePlot::new(8, 3, 1000, 10.0, 20.0);
        assert!(!coincident(&a, &other_drone));
    }

    #[test]
    fn test_single_edge_skew() {
        // Two nodes saw the same event five seconds apart on their own clocks
        let db = db_with(vec![
            flagged(7, 2, 1000, 10.0, 20.0),
            flagged(7, 3, 1005, 10.0, 20.0),
        ]);

        let mut recon = Reconciler::new();
        recon.reconcile(&db);

        let plots = db.lock().clone();
        assert_eq!(plots.len(), 1);
        assert_eq!(plots[0].node_id, 2);
        assert_eq!(plots[0].timestamp, 1000);
        assert!(!plots[0].flag_set(FLAG_NEWLY_RECEIVED));

        assert_eq!(recon.leader(), Some(2));
        assert_eq!(recon.skews().edges(), &[SkewEdge { low: 2, high: 3, delta: 5 }]);
    }

    #[test]
    fn test_transitive_skew() {
        // Coincidences pin (1,2,+3) and (2,3,+4); a lone node-3 plot then
        // translates through both edges into node 1's frame.
        let db = db_with(vec![
            flagged(1, 1, 500, 30.0, 40.0),
            flagged(1, 2, 503, 30.0, 40.0),
            flagged(2, 2, 600, 31.0, 41.0),
            flagged(2, 3, 604, 31.0, 41.0),
            flagged(9, 3, 100, 50.0, 60.0),
        ]);

        let mut recon = Reconciler::new();
        recon.reconcile(&db);

        let plots = db.lock().clone();
        assert_eq!(recon.leader(), Some(1));
        assert!(plots.iter().all(|p| p.node_id == 1));

        let lone = plots.iter().find(|p| p.drone_id == 9).unwrap();
        assert_eq!(lone.timestamp, 93);

        // The coincident pairs collapsed
        assert_eq!(plots.len(), 3);
    }

    #[test]
    fn test_deferred_reconciliation() {
        let db = db_with(vec![
            DronePlot::new(4, 1, 50, 0.0, 0.0),
            flagged(6, 5, 200, 5.0, 5.0),
        ]);

        let mut recon = Reconciler::new();
        recon.reconcile(&db);

        // No path from node 5 to the leader yet: left untranslated, flagged
        {
            let plots = db.lock();
            let orphan = plots.iter().find(|p| p.node_id == 5).unwrap();
            assert_eq!(orphan.timestamp, 200);
            assert!(orphan.flag_set(FLAG_NEWLY_RECEIVED));
        }

        // A later coincidence links the nodes
        db.push(flagged(8, 1, 300, 7.0, 7.0));
        db.push(flagged(8, 5, 310, 7.0, 7.0));
        recon.reconcile(&db);

        assert_eq!(recon.skews().edges(), &[SkewEdge { low: 1, high: 5, delta: 10 }]);

        let plots = db.lock().clone();
        let swept = plots.iter().find(|p| p.drone_id == 6).unwrap();
        assert_eq!(swept.node_id, 1);
        assert_eq!(swept.timestamp, 190);
        assert!(!swept.flag_set(FLAG_NEWLY_RECEIVED));
    }

    #[test]
    fn test_no_coincident_pairs_remain() {
        let db = db_with(vec![
            flagged(7, 2, 1000, 10.0, 20.0),
            flagged(7, 3, 1005, 10.0, 20.0),
            flagged(7, 4, 1003, 10.0, 20.0),
            flagged(8, 2, 2000, 12.0, 22.0),
            flagged(8, 3, 2005, 12.0, 22.0),
        ]);

        let mut recon = Reconciler::new();
        recon.reconcile(&db);

        let plots = db.lock().clone();
        for (i, a) in plots.iter().enumerate() {
            for b in plots.iter().skip(i + 1) {
                assert!(!coincident(a, b), "coincident pair survived: {:?} / {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let db = db_with(vec![
            flagged(7, 2, 1000, 10.0, 20.0),
            flagged(7, 3, 1005, 10.0, 20.0),
            flagged(9, 6, 400, 1.0, 1.0),
        ]);

        let mut recon = Reconciler::new();
        recon.reconcile(&db);
        let first = db.lock().clone();

        recon.reconcile(&db);
        let second = db.lock().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_store_is_noop() {
        let db = PlotDb::new();
        let mut recon = Reconciler::new();
        recon.reconcile(&db);
        assert_eq!(recon.leader(), None);
        assert!(db.is_empty());
    }
}
