//! Fixture files: leads, sequences and templates loaded into the in-memory
//! collaborators. Used by the CLI and integration tests.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::lead::Lead;
use crate::render::{Template, TemplateRenderer};
use crate::sequence::SequenceDefinition;
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    pub leads: Vec<Lead>,
    pub sequences: Vec<SequenceDefinition>,
    pub templates: HashMap<String, Template>,
}

impl Fixtures {
    /// Reads a fixture file. `.toml` files are parsed as TOML, anything else
    /// as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let fixtures = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str::<Fixtures>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            _ => serde_json::from_str::<Fixtures>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
        };
        debug!(
            leads = fixtures.leads.len(),
            sequences = fixtures.sequences.len(),
            templates = fixtures.templates.len(),
            "fixtures loaded"
        );
        Ok(fixtures)
    }

    /// Gives leads without an id a fresh one, and stamps a missing
    /// `created_at` with `now`.
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        for lead in &mut self.leads {
            if lead.id.is_nil() {
                lead.id = Uuid::new_v4();
            }
            if lead.created_at == DateTime::<Utc>::default() {
                lead.created_at = now;
            }
        }
    }

    /// Saves leads and sequences into `store` and returns a renderer over the
    /// templates.
    pub fn install(&self, store: &dyn Store) -> Result<TemplateRenderer> {
        for lead in &self.leads {
            store.save_lead(lead.clone())?;
        }
        for sequence in &self.sequences {
            store
                .save_sequence(sequence.clone())
                .with_context(|| format!("invalid sequence {}", sequence.name))?;
        }
        Ok(TemplateRenderer::new(self.templates.clone()))
    }
}
