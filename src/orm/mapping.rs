//! Statically declared field bindings between a Rust type and its table.

use crate::db::value::{Row, Value};
use crate::error::TickError;
use crate::orm::codec;
use crate::orm::column::FieldDef;
use crate::orm::table::{Table, VERSION_COLUMN};

pub type Getter<T> = fn(&T) -> Result<Value, TickError>;
pub type Setter<T> = fn(&mut T, Value) -> Result<(), TickError>;

/// A type the mapper can store.
///
/// Rows are read back by starting from `Default::default()` and running each
/// field's setter, so no constructor logic runs.
///
/// ```ignore
/// impl Mapped for Player {
///     fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
///         t.field(
///             FieldDef::new("id", FieldKind::Integer).primary_key().auto_increment(),
///             |p| Ok(p.id.into()),
///             |p, v| { p.id = v.as_i64().unwrap_or_default(); Ok(()) },
///         )?;
///         Ok(())
///     }
/// }
/// ```
pub trait Mapped: Default + Send + 'static {
    fn table_name() -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    fn describe(table: &mut TableBuilder<Self>) -> Result<(), TickError>;
}

pub(crate) struct FieldBinding<T> {
    pub(crate) def: FieldDef,
    get: Getter<T>,
    set: Setter<T>,
}

pub struct TableBuilder<T> {
    table: Table,
    bindings: Vec<FieldBinding<T>>,
}

impl<T> TableBuilder<T> {
    pub fn field(
        &mut self,
        def: FieldDef,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Result<&mut Self, TickError> {
        self.table.add_column(def.to_column())?;
        self.bindings.push(FieldBinding { def, get, set });
        Ok(self)
    }
}

/// The built table of a mapped type plus how to move values in and out of it.
pub struct TableMapping<T> {
    table: Table,
    bindings: Vec<FieldBinding<T>>,
}

impl<T: Mapped> TableMapping<T> {
    pub fn build(version: &str) -> Result<Self, TickError> {
        let mut builder = TableBuilder {
            table: Table::new(T::table_name(), version),
            bindings: Vec::new(),
        };
        T::describe(&mut builder)?;
        let TableBuilder { mut table, bindings } = builder;
        table.seal()?;
        Ok(Self { table, bindings })
    }
}

impl<T> TableMapping<T> {
    pub fn table(&self) -> &Table {
        &self.table
    }

    fn key_binding(&self) -> Result<&FieldBinding<T>, TickError> {
        self.bindings
            .iter()
            .find(|b| b.def.primary_key)
            .ok_or_else(|| TickError::MissingPrimaryKey(self.table.name.clone()))
    }

    pub fn key_value(&self, instance: &T) -> Result<Value, TickError> {
        let binding = self.key_binding()?;
        Ok(codec::encode_for_write((binding.get)(instance)?))
    }

    pub fn key_is_auto_increment(&self) -> bool {
        self.key_binding().is_ok_and(|b| b.def.auto_increment)
    }

    /// Whether `key` identifies a stored row. NULL and empty text never do;
    /// zero doesn't for auto-increment keys.
    pub fn is_assigned(&self, key: &Value) -> bool {
        match key {
            Value::Null => false,
            Value::Text(s) => !s.is_empty(),
            Value::Int(0) => !self.key_is_auto_increment(),
            _ => true,
        }
    }

    /// Every column value of `instance`, encoded for binding, with the
    /// current version. The auto-increment key is left out when unassigned.
    pub fn to_row(&self, instance: &T) -> Result<Row, TickError> {
        let mut row = Row::with_capacity(self.bindings.len() + 1);
        for binding in &self.bindings {
            let value = codec::encode_for_write((binding.get)(instance)?);
            if binding.def.primary_key && binding.def.auto_increment && !self.is_assigned(&value) {
                continue;
            }
            row.insert(binding.def.name.clone(), value);
        }
        row.insert(VERSION_COLUMN, self.table.version.clone());
        Ok(row)
    }

    pub fn from_row(&self, mut row: Row) -> Result<T, TickError>
    where
        T: Default,
    {
        let mut instance = T::default();
        for binding in &self.bindings {
            let value = codec::coerce(&binding.def, row.remove(&binding.def.name))?;
            (binding.set)(&mut instance, value)?;
        }
        Ok(instance)
    }

    pub fn set_key(&self, instance: &mut T, id: i64) -> Result<(), TickError> {
        let binding = self.key_binding()?;
        (binding.set)(instance, Value::Int(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::column::FieldKind;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq)]
    struct Player {
        id: i64,
        name: String,
        online: bool,
        tags: Vec<String>,
    }

    impl Mapped for Player {
        fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
            t.field(
                FieldDef::new("id", FieldKind::Integer)
                    .primary_key()
                    .auto_increment(),
                |p| Ok(p.id.into()),
                |p, v| {
                    p.id = v.as_i64().unwrap_or_default();
                    Ok(())
                },
            )?
            .field(
                FieldDef::new("name", FieldKind::Text).size(16),
                |p| Ok(p.name.clone().into()),
                |p, v| {
                    p.name = v.into_string().unwrap_or_default();
                    Ok(())
                },
            )?
            .field(
                FieldDef::new("online", FieldKind::Bool),
                |p| Ok(p.online.into()),
                |p, v| {
                    p.online = v.as_bool().unwrap_or_default();
                    Ok(())
                },
            )?
            .field(
                FieldDef::new("tags", FieldKind::Structured),
                |p| codec::structured(&p.tags),
                |p, v| {
                    p.tags = codec::from_structured(v)?;
                    Ok(())
                },
            )?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Keyless;

    impl Mapped for Keyless {
        fn describe(t: &mut TableBuilder<Self>) -> Result<(), TickError> {
            t.field(
                FieldDef::new("x", FieldKind::Integer),
                |_| Ok(Value::Int(1)),
                |_, _| Ok(()),
            )?;
            Ok(())
        }
    }

    #[test]
    fn table_name_defaults_to_type_name() {
        let mapping = TableMapping::<Player>::build("1.0").unwrap();
        assert_eq!(mapping.table().name, "Player");
        assert_eq!(
            mapping.table().column_names(),
            vec!["id", "name", "online", "tags", VERSION_COLUMN]
        );
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        assert!(matches!(
            TableMapping::<Keyless>::build("1"),
            Err(TickError::MissingPrimaryKey(name)) if name == "Keyless"
        ));
    }

    #[test]
    fn unassigned_auto_increment_key_is_left_out() {
        let mapping = TableMapping::<Player>::build("1.0").unwrap();
        let player = Player {
            name: "steve".into(),
            tags: vec!["op".into()],
            ..Default::default()
        };
        let row = mapping.to_row(&player).unwrap();
        assert_eq!(
            row.columns().collect::<Vec<_>>(),
            vec!["name", "online", "tags", VERSION_COLUMN]
        );
        assert_eq!(row.get("tags"), Some(&Value::from(r#"["op"]"#)));
        assert_eq!(row.get(VERSION_COLUMN), Some(&Value::from("1.0")));
        assert!(!mapping.is_assigned(&mapping.key_value(&player).unwrap()));
    }

    #[test]
    fn rows_are_coerced_into_instances() {
        let mapping = TableMapping::<Player>::build("1.0").unwrap();
        let row: Row = [
            ("id", Value::Int(4)),
            ("name", Value::Null),
            ("online", Value::Int(1)),
            ("tags", Value::from(json!(["a", "b"]).to_string())),
        ]
        .into_iter()
        .collect();
        let player = mapping.from_row(row).unwrap();
        assert_eq!(
            player,
            Player {
                id: 4,
                name: String::new(),
                online: true,
                tags: vec!["a".into(), "b".into()],
            }
        );

        let mut player = player;
        mapping.set_key(&mut player, 99).unwrap();
        assert_eq!(player.id, 99);
    }
}
