//! Capture visibility filters and their composition.

use std::sync::Arc;

use cdxstore_core::Capture;

use crate::Result;

/// A pure visibility predicate over captures.
///
/// Filters run inside the query stream, so `accept` must not block on
/// anything slower than it is willing to make every result line. A filter
/// that cannot decide (e.g. an unreachable oracle) errors rather than
/// silently allowing the record.
pub trait CaptureFilter: Send + Sync {
    fn accept(&self, capture: &Capture) -> Result<bool>;
}

/// Short-circuit conjunction of filters: the first rejection suppresses the
/// record, the first error aborts the stream.
#[derive(Default, Clone)]
pub struct FilterChain {
    filters: Vec<Arc<dyn CaptureFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn CaptureFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl CaptureFilter for FilterChain {
    fn accept(&self, capture: &Capture) -> Result<bool> {
        for filter in &self.filters {
            if !filter.accept(capture)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(bool);

    impl CaptureFilter for Fixed {
        fn accept(&self, _capture: &Capture) -> Result<bool> {
            Ok(self.0)
        }
    }

    struct Counting(AtomicUsize);

    impl CaptureFilter for Counting {
        fn accept(&self, _capture: &Capture) -> Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    struct Failing;

    impl CaptureFilter for Failing {
        fn accept(&self, _capture: &Capture) -> Result<bool> {
            Err(StoreError::OracleUnavailable("down".to_string()))
        }
    }

    fn capture() -> Capture {
        Capture {
            urlkey: "org,example)/".to_string(),
            timestamp: 20200101000000,
            original: "http://example.org/".to_string(),
            mimetype: "text/html".to_string(),
            status: 200,
            digest: "sha1:AAA".to_string(),
            redirecturl: "-".to_string(),
            length: 100,
            compressed_offset: 0,
            file: "a.warc.gz".to_string(),
        }
    }

    #[test]
    fn empty_chain_accepts() {
        assert!(FilterChain::new().accept(&capture()).unwrap());
    }

    #[test]
    fn rejection_short_circuits_later_filters() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let mut chain = FilterChain::new();
        chain.push(Arc::new(Fixed(false)));
        chain.push(counter.clone());

        assert!(!chain.accept(&capture()).unwrap());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn errors_propagate() {
        let mut chain = FilterChain::new();
        chain.push(Arc::new(Failing));
        assert!(matches!(
            chain.accept(&capture()),
            Err(StoreError::OracleUnavailable(_))
        ));
    }
}
