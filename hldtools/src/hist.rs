//! Histogram sink boundary: the core records samples through opaque
//! handles and never reads contents back

use parking_lot::Mutex;

/// Opaque handle to a 1-d histogram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct H1(pub usize);

/// Opaque handle to a 2-d histogram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct H2(pub usize);

/// Opaque handle to a registered two-sided condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct C1(pub usize);

/// Collaborator interface for metric recording. Implementations own naming
/// and storage; processors only create handles and fill samples.
pub trait HistSink: Send + Sync {
    fn make_h1(&self, name: &str, title: &str, nbins: usize, left: f64, right: f64) -> H1;
    fn make_h2(
        &self,
        name: &str,
        title: &str,
        nbins_x: usize,
        left_x: f64,
        right_x: f64,
        nbins_y: usize,
        left_y: f64,
        right_y: f64,
    ) -> H2;
    fn make_c1(&self, name: &str, left: f64, right: f64) -> C1;
    fn change_c1(&self, handle: C1, left: f64, right: f64);
    fn fill_h1(&self, handle: H1, x: f64, weight: f64);
    fn fill_h2(&self, handle: H2, x: f64, y: f64, weight: f64);
}

/// Sink that drops everything; the default when metrics are disabled
pub struct NullSink;

impl HistSink for NullSink {
    fn make_h1(&self, _: &str, _: &str, _: usize, _: f64, _: f64) -> H1 {
        H1(0)
    }

    fn make_h2(
        &self,
        _: &str,
        _: &str,
        _: usize,
        _: f64,
        _: f64,
        _: usize,
        _: f64,
        _: f64,
    ) -> H2 {
        H2(0)
    }

    fn make_c1(&self, _: &str, _: f64, _: f64) -> C1 {
        C1(0)
    }

    fn change_c1(&self, _: C1, _: f64, _: f64) {}

    fn fill_h1(&self, _: H1, _: f64, _: f64) {}

    fn fill_h2(&self, _: H2, _: f64, _: f64, _: f64) {}
}

#[derive(Debug, Clone)]
struct MemH1 {
    name: String,
    left: f64,
    right: f64,
    bins: Vec<f64>,
    under: f64,
    over: f64,
}

#[derive(Debug, Default)]
struct MemInner {
    h1: Vec<MemH1>,
    h2: Vec<(String, f64)>,
    c1: Vec<(String, f64, f64)>,
}

/// In-memory sink for tests and the bundled driver: fixed-width 1-d bins
/// plus under/overflow, 2-d reduced to a fill counter.
#[derive(Default)]
pub struct MemSink {
    inner: Mutex<MemInner>,
}

impl MemSink {
    pub fn new() -> Self {
        MemSink::default()
    }

    /// Total weight filled into a named 1-d histogram
    pub fn h1_entries(&self, name: &str) -> f64 {
        let inner = self.inner.lock();
        inner
            .h1
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.bins.iter().sum::<f64>() + h.under + h.over)
            .unwrap_or(0.)
    }

    pub fn h1_names(&self) -> Vec<String> {
        self.inner.lock().h1.iter().map(|h| h.name.clone()).collect()
    }

    pub fn c1_limits(&self, name: &str) -> Option<(f64, f64)> {
        let inner = self.inner.lock();
        inner
            .c1
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|&(_, l, r)| (l, r))
    }
}

impl HistSink for MemSink {
    fn make_h1(&self, name: &str, _title: &str, nbins: usize, left: f64, right: f64) -> H1 {
        let mut inner = self.inner.lock();
        inner.h1.push(MemH1 {
            name: name.to_string(),
            left,
            right,
            bins: vec![0.; nbins],
            under: 0.,
            over: 0.,
        });
        H1(inner.h1.len() - 1)
    }

    fn make_h2(
        &self,
        name: &str,
        _title: &str,
        _nbins_x: usize,
        _left_x: f64,
        _right_x: f64,
        _nbins_y: usize,
        _left_y: f64,
        _right_y: f64,
    ) -> H2 {
        let mut inner = self.inner.lock();
        inner.h2.push((name.to_string(), 0.));
        H2(inner.h2.len() - 1)
    }

    fn make_c1(&self, name: &str, left: f64, right: f64) -> C1 {
        let mut inner = self.inner.lock();
        inner.c1.push((name.to_string(), left, right));
        C1(inner.c1.len() - 1)
    }

    fn change_c1(&self, handle: C1, left: f64, right: f64) {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.c1.get_mut(handle.0) {
            c.1 = left;
            c.2 = right;
        }
    }

    fn fill_h1(&self, handle: H1, x: f64, weight: f64) {
        let mut inner = self.inner.lock();
        if let Some(h) = inner.h1.get_mut(handle.0) {
            if h.bins.is_empty() {
                h.over += weight;
            } else if x < h.left {
                h.under += weight;
            } else if x >= h.right {
                h.over += weight;
            } else {
                let idx = ((x - h.left) / (h.right - h.left) * h.bins.len() as f64) as usize;
                let last = h.bins.len() - 1;
                h.bins[idx.min(last)] += weight;
            }
        }
    }

    fn fill_h2(&self, handle: H2, _x: f64, _y: f64, weight: f64) {
        let mut inner = self.inner.lock();
        if let Some(h) = inner.h2.get_mut(handle.0) {
            h.1 += weight;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_sink_accumulates() {
        let sink = MemSink::new();
        let h = sink.make_h1("hits", "hit times", 10, 0., 10.);
        sink.fill_h1(h, 0.5, 1.);
        sink.fill_h1(h, 9.5, 2.);
        sink.fill_h1(h, -1., 1.);
        sink.fill_h1(h, 42., 1.);
        assert_eq!(sink.h1_entries("hits"), 5.);
        assert_eq!(sink.h1_entries("missing"), 0.);
    }

    #[test]
    fn c1_registration_and_change() {
        let sink = MemSink::new();
        let c = sink.make_c1("window", -1., 1.);
        assert_eq!(sink.c1_limits("window"), Some((-1., 1.)));
        sink.change_c1(c, -2., 3.);
        assert_eq!(sink.c1_limits("window"), Some((-2., 3.)));
    }
}
