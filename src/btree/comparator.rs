//! Key ordering. Every tree uses byte-lexicographic order by default;
//! callers that need a different order (e.g. numeric record numbers
//! printed in a fixed-width encoding) supply their own. Held as a
//! plain `Arc<dyn Fn>` rather than a trait object hierarchy, matching
//! how small, stateless strategy objects are threaded through the
//! rest of this crate (see `crate::buffer_pool::PageCodec`).

use std::{cmp::Ordering, sync::Arc};

pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

pub fn default_comparator() -> Comparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}
