use anyhow::{bail, Result};
use sdbatch_contracts::catalog::{Catalog, CatalogKind};
use sdbatch_contracts::events::AuditLog;

use crate::files::ImageFiles;

/// Run-scoped state threaded through expansion.
pub struct RunContext<'a> {
    pub catalog: &'a Catalog,
    pub files: &'a dyn ImageFiles,
    pub audit: &'a AuditLog,
    notices: Vec<String>,
}

impl<'a> RunContext<'a> {
    pub fn new(catalog: &'a Catalog, files: &'a dyn ImageFiles, audit: &'a AuditLog) -> Self {
        Self {
            catalog,
            files,
            audit,
            notices: Vec::new(),
        }
    }

    /// Records a notice once per run, in the audit log and the notice list.
    pub fn notice(&mut self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        if self.notices.iter().any(|existing| existing == &message) {
            return Ok(());
        }
        self.audit.notice(&message)?;
        self.notices.push(message);
        Ok(())
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn into_notices(self) -> Vec<String> {
        self.notices
    }

    /// Canonical name for a required kind; a miss is the kind's fatal error.
    pub fn require<S: AsRef<str>>(&self, kind: CatalogKind, candidates: &[S]) -> Result<String> {
        match self.catalog.resolve(kind, candidates)? {
            Some(name) => Ok(name),
            None => bail!("{} is not a required catalog kind", kind.label()),
        }
    }

    /// Canonical name for an optional kind; a miss leaves a notice.
    pub fn optional(&mut self, kind: CatalogKind, name: &str) -> Result<Option<String>> {
        if let Some(found) = self.catalog.lookup(kind, &[name]) {
            return Ok(Some(found));
        }
        self.notice(format!("{} '{}' not found in catalog", kind.label(), name))?;
        Ok(None)
    }
}
