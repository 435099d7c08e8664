use crate::db::credentials::DatabaseKind;
use crate::db::value::Value;

/// Storage class of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Stored as 0/1.
    Bool,
    Integer,
    Float,
    Text,
    /// Serde value stored as canonical JSON text.
    Structured,
    /// Serde value stored as an opaque binary blob.
    Opaque,
}

/// Declarative description of one mapped field, validated when the table is built.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub size: Option<u32>,
    pub nullable: bool,
    pub default: Option<Value>,
    pub constraints: Vec<String>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub sql_type: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
            nullable: false,
            default: None,
            constraints: Vec::new(),
            primary_key: false,
            auto_increment: false,
            sql_type: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Use this SQL type verbatim instead of the one derived from the kind.
    pub fn sql_type(mut self, sql_type: impl Into<String>) -> Self {
        self.sql_type = Some(sql_type.into());
        self
    }

    fn base_type(&self) -> String {
        if let Some(explicit) = &self.sql_type {
            return explicit.clone();
        }
        match self.kind {
            FieldKind::Bool => "TINYINT(1)".to_string(),
            FieldKind::Integer => match self.size {
                Some(n) => format!("INT({n})"),
                None => "BIGINT".to_string(),
            },
            FieldKind::Float => "DOUBLE".to_string(),
            FieldKind::Text => format!("VARCHAR({})", self.size.unwrap_or(255)),
            FieldKind::Structured => "TEXT".to_string(),
            FieldKind::Opaque => "BLOB".to_string(),
        }
    }

    /// Value a `NOT NULL` column without a default holds in its empty state.
    fn zero_value(&self) -> Value {
        match self.kind {
            FieldKind::Bool | FieldKind::Integer => Value::Int(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Text => Value::from(""),
            FieldKind::Structured => Value::from("[]"),
            FieldKind::Opaque => Value::Blob(Vec::new()),
        }
    }

    pub fn to_column(&self) -> Column {
        let null = if self.nullable { "NULL" } else { "NOT NULL" };
        let fill = (!self.nullable && self.default.is_none()).then(|| self.zero_value());
        Column {
            name: self.name.clone(),
            sql_type: format!("{} {null}", self.base_type()),
            default: self.default.clone(),
            fill,
            constraints: self.constraints.clone(),
            primary_key: self.primary_key,
            auto_increment: self.auto_increment,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub default: Option<Value>,
    /// Given to existing rows when the column is added to a populated table.
    pub fill: Option<Value>,
    pub constraints: Vec<String>,
    pub primary_key: bool,
    pub auto_increment: bool,
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

impl Column {
    /// DDL fragment for this column. SQLite only supports auto increment on an
    /// `INTEGER PRIMARY KEY`, so such columns are rendered in that exact form.
    pub fn render(&self, kind: DatabaseKind) -> String {
        let mut parts = vec![quote_ident(&self.name)];
        match kind {
            DatabaseKind::Sqlite if self.auto_increment => {
                parts.push("INTEGER PRIMARY KEY AUTOINCREMENT".to_string());
            }
            _ => {
                parts.push(self.sql_type.clone());
                if self.auto_increment {
                    parts.push("AUTO_INCREMENT".to_string());
                }
            }
        }
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {}", default.to_sql_literal()));
        }
        if self.primary_key && !(kind == DatabaseKind::Sqlite && self.auto_increment) {
            parts.push("PRIMARY KEY".to_string());
        }
        parts.extend(self.constraints.iter().cloned());
        parts.join(" ")
    }

    /// Fragment for `ADD COLUMN`. SQLite rejects a `NOT NULL` column without
    /// a default, so it gets the kind's zero value. MySQL fills existing rows
    /// implicitly and refuses literal defaults on `TEXT`/`BLOB`.
    pub fn render_added(&self, kind: DatabaseKind) -> String {
        match (kind, &self.default, &self.fill) {
            (DatabaseKind::Sqlite, None, Some(fill)) => Column {
                default: Some(fill.clone()),
                ..self.clone()
            }
            .render(kind),
            _ => self.render(kind),
        }
    }
}
