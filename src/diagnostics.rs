//! Per-document diagnostics with positional merge.
//!
//! Keyed by document URI. At most one diagnostic occupies a given range
//! start: an upsert whose start matches an existing entry replaces it
//! (last-write-wins by position). Entries stay ordered by start position.

use lsp_types::{Diagnostic, Uri};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Entry = Arc<Mutex<Vec<Diagnostic>>>;

/// Shared store of peer-reported diagnostics for one project.
///
/// Not thread-confined: the outer map lock is held only to resolve the
/// per-URI entry, and each entry serializes its own writers, so concurrent
/// upserts for different URIs never contend and concurrent upserts for the
/// same URI never lose entries.
#[derive(Default)]
pub struct DiagnosticsStore {
    entries: Mutex<HashMap<Uri, Entry>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document's diagnostics wholesale.
    pub fn set(&self, uri: &Uri, mut diagnostics: Vec<Diagnostic>) {
        sort_by_start(&mut diagnostics);
        let entry = self.entry(uri);
        let Ok(mut current) = entry.lock() else {
            return;
        };
        *current = diagnostics;
    }

    /// Merge by range start: a diagnostic whose start matches an existing
    /// one replaces it; disjoint starts accumulate.
    pub fn upsert(&self, uri: &Uri, diagnostics: Vec<Diagnostic>) {
        if diagnostics.is_empty() {
            return;
        }
        let entry = self.entry(uri);
        let Ok(mut current) = entry.lock() else {
            return;
        };
        for diagnostic in diagnostics {
            match current
                .iter_mut()
                .find(|d| d.range.start == diagnostic.range.start)
            {
                Some(existing) => *existing = diagnostic,
                None => current.push(diagnostic),
            }
        }
        sort_by_start(&mut current);
    }

    /// Drop the document's diagnostics.
    pub fn clear(&self, uri: &Uri) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(uri);
        }
    }

    /// Drop every document's diagnostics.
    pub fn clear_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Current diagnostics for the document. Absent documents yield an empty
    /// list, never a sentinel, so callers don't null-check.
    pub fn get(&self, uri: &Uri) -> Vec<Diagnostic> {
        let entry = match self.entries.lock() {
            Ok(entries) => entries.get(uri).cloned(),
            Err(_) => None,
        };
        entry
            .and_then(|e| e.lock().ok().map(|d| d.clone()))
            .unwrap_or_default()
    }

    /// URIs currently holding at least one diagnostic.
    pub fn documents(&self) -> Vec<Uri> {
        match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|(_, e)| e.lock().map(|d| !d.is_empty()).unwrap_or(false))
                .map(|(uri, _)| uri.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn entry(&self, uri: &Uri) -> Entry {
        match self.entries.lock() {
            Ok(mut entries) => entries.entry(uri.clone()).or_default().clone(),
            Err(_) => Entry::default(),
        }
    }
}

fn sort_by_start(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by_key(|d| (d.range.start.line, d.range.start.character));
}
