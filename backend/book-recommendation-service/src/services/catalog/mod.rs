// ============================================
// Book Catalog Snapshot
// ============================================
//
// Read-mostly view of the book store: content features, metadata
// used by request filters, and popularity percentiles.
//
// Replaced wholesale when an "embeddings updated" signal carries a
// new catalog; readers hold an Arc to the snapshot they started with.

use crate::models::{Book, BookId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Immutable catalog generation
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    books: BTreeMap<BookId, Book>,
    popularity_percentile: HashMap<BookId, f64>,
    version: Option<String>,
}

impl CatalogSnapshot {
    pub fn new(books: Vec<Book>, version: Option<String>) -> Self {
        let books: BTreeMap<BookId, Book> = books.into_iter().map(|b| (b.id.clone(), b)).collect();
        let popularity_percentile = compute_percentiles(&books);
        Self {
            books,
            popularity_percentile,
            version,
        }
    }

    pub fn get(&self, book_id: &str) -> Option<&Book> {
        self.books.get(book_id)
    }

    /// Books in ascending id order
    pub fn books(&self) -> impl Iterator<Item = &Book> {
        self.books.values()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Share of catalog books strictly less popular, in [0, 1]
    pub fn popularity_percentile(&self, book_id: &str) -> f64 {
        self.popularity_percentile
            .get(book_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

fn compute_percentiles(books: &BTreeMap<BookId, Book>) -> HashMap<BookId, f64> {
    let mut popularity: Vec<f64> = books.values().map(|b| b.popularity).collect();
    popularity.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let denom = popularity.len().saturating_sub(1).max(1) as f64;

    books
        .values()
        .map(|book| {
            let lower = popularity.partition_point(|p| *p < book.popularity);
            (book.id.clone(), (lower as f64 / denom).clamp(0.0, 1.0))
        })
        .collect()
}

/// Atomically swappable catalog
pub struct BookCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl BookCatalog {
    pub fn new(books: Vec<Book>) -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::new(books, None))),
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new catalog generation.
    ///
    /// Returns `false` when `version` matches the live snapshot, leaving it untouched.
    pub fn replace(&self, books: Vec<Book>, version: Option<String>) -> bool {
        if version.is_some() && self.snapshot().version() == version.as_deref() {
            return false;
        }

        let next = Arc::new(CatalogSnapshot::new(books, version));
        let count = next.len();
        {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            *guard = next;
        }

        info!(books = count, "Book catalog replaced");
        true
    }
}
