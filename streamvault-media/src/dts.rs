/// DTS extractor with a fixed reorder window.
///
/// Frame PTS values arrive in presentation order with up to `depth` frames of
/// reordering (B-frames). The decode timestamp of the oldest pending frame is
/// the smallest PTS seen so far, which yields a monotonically increasing DTS
/// that never exceeds the current PTS. The extractor must be created at a
/// random-access unit; feeding it mid-GOP produces timestamps that jump
/// backwards.
#[derive(Debug)]
pub struct DtsExtractor {
    pending: Vec<i64>,
    last: Option<i64>,
    depth: usize,
}

impl DtsExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::with_depth(2)
    }

    #[must_use]
    pub fn with_depth(depth: usize) -> Self {
        Self {
            pending: Vec::with_capacity(depth + 1),
            last: None,
            depth,
        }
    }

    /// Feed the PTS of the next access unit and get its DTS.
    pub fn extract(&mut self, pts: i64) -> i64 {
        self.pending.push(pts);
        self.pending.sort_unstable();

        let candidate = if self.pending.len() > self.depth {
            self.pending.remove(0)
        } else {
            self.pending[0]
        };

        // Keep DTS strictly increasing and never ahead of PTS.
        let dts = match self.last {
            Some(last) if candidate <= last => last + 1,
            _ => candidate,
        };
        let dts = dts.min(pts).max(self.last.map_or(i64::MIN, |l| l + 1));
        self.last = Some(dts);
        dts
    }
}

impl Default for DtsExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_without_bframes() {
        let mut e = DtsExtractor::new();
        let mut prev = i64::MIN;
        for pts in [0i64, 3000, 6000, 9000, 12000] {
            let dts = e.extract(pts);
            assert!(dts > prev, "dts {dts} not increasing past {prev}");
            assert!(dts <= pts, "dts {dts} ahead of pts {pts}");
            prev = dts;
        }
    }

    #[test]
    fn test_reordered_pts() {
        // IBP pattern: presentation order I(0) P(9000) B(3000) B(6000)
        let mut e = DtsExtractor::new();
        let mut prev = i64::MIN;
        for pts in [0i64, 9000, 3000, 6000, 18000, 12000, 15000] {
            let dts = e.extract(pts);
            assert!(dts > prev);
            assert!(dts <= pts);
            prev = dts;
        }
    }
}
