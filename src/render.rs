//! Message rendering.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LeadflowError, Result};
use crate::lead::Lead;

/// `{{ key }}` placeholders.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Values available to templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeData(BTreeMap<String, String>);

impl MergeData {
    pub fn from_lead(lead: &Lead) -> Self {
        let mut data = Self::default();
        data.set("first_name", lead.first_name());
        data.set("last_name", lead.last_name());
        for (key, value) in [
            ("full_name", &lead.name),
            ("email", &lead.email),
            ("phone", &lead.phone),
            ("company", &lead.company),
            ("industry", &lead.industry),
            ("location", &lead.location),
            ("source", &lead.source),
        ] {
            data.set(key, Lead::field(value).unwrap_or_default());
        }
        if let Some(grade) = lead.grade {
            data.set("grade", grade.to_string());
        }
        data
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
    pub tracking_refs: Vec<String>,
}

/// Turns a template reference plus merge data into message content.
pub trait Renderer: Send + Sync {
    fn render(&self, template_id: &str, data: &MergeData) -> Result<Rendered>;
}

/// In-memory templates with `{{key}}` substitution. Unknown keys render as
/// empty text.
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    templates: HashMap<String, Template>,
}

impl TemplateRenderer {
    pub fn new(templates: HashMap<String, Template>) -> Self {
        Self { templates }
    }

    pub fn insert(&mut self, id: impl Into<String>, template: Template) {
        self.templates.insert(id.into(), template);
    }

    fn fill(text: &str, data: &MergeData) -> String {
        PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| {
                data.get(&caps[1]).unwrap_or_default().to_string()
            })
            .into_owned()
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, template_id: &str, data: &MergeData) -> Result<Rendered> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| LeadflowError::not_found("template", template_id))?;
        let subject = Self::fill(&template.subject, data);
        if subject.trim().is_empty() {
            return Err(LeadflowError::Render(format!(
                "template {template_id} rendered an empty subject"
            )));
        }
        Ok(Rendered {
            subject,
            body: Self::fill(&template.body, data),
            tracking_refs: vec![Uuid::new_v4().to_string()],
        })
    }
}
