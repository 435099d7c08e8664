//! Named, parameterised query templates parsed from a query resource.
//!
//! Resource blocks look like:
//!
//! ```text
//! -- players.get(name, limit) {
//!     SELECT * FROM players WHERE name = ':name' LIMIT :limit -- trailing notes
//! }
//! ```
//!
//! Substitution is purely textual. Arguments are NOT escaped; callers must
//! only pass trusted values.

use crate::error::TickError;
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::LazyLock;
use tracing::{debug, warn};

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"--\s+([\w.]+)\s*\(([^)]*)\)\s*\{\s*([^}]+)\s*\}").expect("valid block regex")
});

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^:\w]):([A-Za-z_]\w*)").expect("valid placeholder regex"));

/// Queries whose id contains this marker run while the connection opens.
pub const INIT_MARKER: &str = "__init";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    pub id: String,
    pub sql: String,
    pub params: Vec<String>,
}

impl QueryTemplate {
    pub fn is_init(&self) -> bool {
        self.id.contains(INIT_MARKER)
    }

    /// Placeholders referenced in the body that are not declared parameters.
    fn undeclared_placeholders(&self) -> Vec<String> {
        let declared: HashSet<&str> = self.params.iter().map(String::as_str).collect();
        PLACEHOLDER_RE
            .captures_iter(&self.sql)
            .filter_map(|c| c.get(2))
            .map(|m| m.as_str())
            .filter(|name| !declared.contains(name))
            .map(str::to_owned)
            .collect()
    }
}

/// Immutable mapping of query id to template, in resource order.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    templates: IndexMap<String, QueryTemplate>,
}

impl QueryRegistry {
    /// Parse a query resource. An absent resource yields an empty registry.
    pub fn load(resource: Option<&str>) -> Self {
        let Some(text) = resource else {
            debug!("no query resource provided; registry is empty");
            return Self::default();
        };

        let mut templates = IndexMap::new();
        for caps in BLOCK_RE.captures_iter(text) {
            let id = caps[1].to_string();
            let body = &caps[3];
            let sql = match body.find("--") {
                Some(pos) => &body[..pos],
                None => body,
            };
            let params: Vec<String> = if caps[2].trim().is_empty() {
                Vec::new()
            } else {
                caps[2].split(',').map(|a| a.trim().to_string()).collect()
            };

            let template = QueryTemplate {
                id: id.clone(),
                sql: sql.to_string(),
                params,
            };
            let undeclared = template.undeclared_placeholders();
            if !undeclared.is_empty() {
                warn!(query = %id, ?undeclared, "skipping query with undeclared placeholders");
                continue;
            }
            templates.insert(id, template);
        }

        debug!(count = templates.len(), "query resource loaded");
        Self { templates }
    }

    pub fn get(&self, id: &str) -> Result<&QueryTemplate, TickError> {
        self.templates
            .get(id)
            .ok_or_else(|| TickError::UnknownQuery(id.to_string()))
    }

    /// Substitute every declared `:param` with its stringified argument, in a
    /// single pass over the template so argument text is never rescanned.
    pub fn render(&self, id: &str, args: &[(&str, &dyn Display)]) -> Result<String, TickError> {
        let template = self.get(id)?;

        let mut values = HashMap::with_capacity(template.params.len());
        for param in &template.params {
            let value = args
                .iter()
                .find(|(name, _)| name == param)
                .map(|(_, value)| value.to_string())
                .ok_or_else(|| TickError::MissingArgument {
                    query: id.to_string(),
                    argument: param.clone(),
                })?;
            values.insert(param.as_str(), value);
        }

        let sql = PLACEHOLDER_RE.replace_all(&template.sql, |caps: &Captures<'_>| {
            match values.get(&caps[2]) {
                Some(value) => format!("{}{value}", &caps[1]),
                None => caps[0].to_string(),
            }
        });
        Ok(sql.into_owned())
    }

    pub fn init_queries(&self) -> impl Iterator<Item = &QueryTemplate> {
        self.templates.values().filter(|t| t.is_init())
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
