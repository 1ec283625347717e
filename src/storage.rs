use crate::error::{IndexError, SubstrateError};
use std::sync::{Arc, RwLock};

/// Forward-only cursor over a sorted key space.
///
/// `seek(prefix)` positions the cursor so that the next successful `next_item()` yields the
/// first key `>= prefix`. `item()` is only meaningful after `next_item()` returned `true`.
pub trait TableCursor {
    fn seek(&mut self, prefix: &[u8]);
    fn next_item(&mut self) -> bool;
    fn item(&self) -> &[u8];
    /// Error that stopped iteration, if any. Checked once `next_item()` returns `false`.
    fn error(&mut self) -> Option<SubstrateError>;
}

/// Sorted key-value substrate the index rows live in.
///
/// Implementations must allow concurrent cursors; each query owns one exclusively.
pub trait Substrate: Send + Sync {
    fn cursor(&self) -> Box<dyn TableCursor + Send + '_>;
}

/// Simple in-memory sorted table.
///
/// Items are kept as one sorted, deduplicated vector behind an `Arc`; writers build a new
/// vector and swap it in, so open cursors keep iterating the snapshot they started on.
#[derive(Debug, Default)]
pub struct MemTable {
    items: RwLock<Arc<Vec<Vec<u8>>>>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from arbitrary (unsorted, possibly duplicated) items.
    pub fn from_items(items: Vec<Vec<u8>>) -> Self {
        let t = Self::new();
        t.replace(items);
        t
    }

    /// Merges `new_items` into the table.
    pub fn add_items(&self, new_items: Vec<Vec<u8>>) -> Result<(), IndexError> {
        if new_items.is_empty() {
            return Ok(());
        }
        let mut incoming = new_items;
        incoming.sort_unstable();
        incoming.dedup();

        let mut guard = self.items.write()?;
        let current = Arc::clone(&guard);
        let mut merged = Vec::with_capacity(current.len() + incoming.len());
        let (mut i, mut j) = (0, 0);
        while i < current.len() && j < incoming.len() {
            match current[i].cmp(&incoming[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(current[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(std::mem::take(&mut incoming[j]));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(current[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend(current[i..].iter().cloned());
        merged.extend(incoming.drain(j..));
        *guard = Arc::new(merged);
        Ok(())
    }

    /// Replaces the whole content (used when loading a snapshot).
    pub fn replace(&self, mut items: Vec<Vec<u8>>) {
        items.sort_unstable();
        items.dedup();
        match self.items.write() {
            Ok(mut g) => *g = Arc::new(items),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(items),
        }
    }

    /// Current immutable snapshot of the items.
    pub fn snapshot(&self) -> Result<Arc<Vec<Vec<u8>>>, IndexError> {
        Ok(Arc::clone(&*self.items.read()?))
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Substrate for MemTable {
    fn cursor(&self) -> Box<dyn TableCursor + Send + '_> {
        let items = match self.items.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        };
        Box::new(MemCursor {
            items,
            next: 0,
            current: None,
        })
    }
}

/// Cursor over one [`MemTable`] snapshot.
#[derive(Debug)]
pub struct MemCursor {
    items: Arc<Vec<Vec<u8>>>,
    next: usize,
    current: Option<usize>,
}

impl TableCursor for MemCursor {
    fn seek(&mut self, prefix: &[u8]) {
        self.next = self.items.partition_point(|it| it.as_slice() < prefix);
        self.current = None;
    }

    fn next_item(&mut self) -> bool {
        if self.next >= self.items.len() {
            self.current = None;
            return false;
        }
        self.current = Some(self.next);
        self.next += 1;
        true
    }

    fn item(&self) -> &[u8] {
        match self.current {
            Some(i) => &self.items[i],
            None => &[],
        }
    }

    fn error(&mut self) -> Option<SubstrateError> {
        None
    }
}
