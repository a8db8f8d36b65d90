//! Diagnostics store: accumulates the latest per-file diagnostics.
//!
//! Each `publishDiagnostics` replaces the file's previous set; an empty
//! set clears the file.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::{Diagnostic, DiagnosticsSnapshot, LspEvent};

#[derive(Debug, Default)]
pub struct DiagnosticsStore {
    data: HashMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, path: PathBuf, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(&path);
        } else {
            self.data.insert(path, items);
        }
    }

    /// Fold an event into the store. Returns whether it carried diagnostics.
    pub fn apply(&mut self, event: &LspEvent) -> bool {
        match event {
            LspEvent::Diagnostics { path, items, .. } => {
                self.update(path.clone(), items.clone());
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();

        files.sort_by(|a, b| {
            let a_err = a.1.iter().any(|d| d.severity.is_error());
            let b_err = b.1.iter().any(|d| d.severity.is_error());
            b_err.cmp(&a_err).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }
}
