use std::sync::Arc;

use dashmap::DashMap;

use super::column_type::ColumnType;
use super::enum8::EnumTable;
use super::ColumnError;

/// Named enums and a cache of parsed type strings.
///
/// One registry is shared by every connection of a pool. Enums registered here can
/// be referenced by name: `Enum8(level)` resolves to the table registered as
/// `level`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    enums: DashMap<String, Arc<EnumTable>>,
    parsed: DashMap<String, ColumnType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an enum whose values get codes 0, 1, 2... in order.
    pub fn register_enum(&self, name: &str, values: &[&str]) -> Result<(), ColumnError> {
        let table = Arc::new(EnumTable::sequential(values)?);
        match self.enums.entry(name.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ColumnError::EnumAlreadyRegistered(name.to_owned()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(table);
                Ok(())
            }
        }
    }

    pub fn lookup_enum(&self, name: &str) -> Option<Arc<EnumTable>> {
        self.enums.get(name).map(|t| t.value().clone())
    }

    /// Parses a type string, resolving named enums. Results are cached by string.
    pub fn parse(&self, type_name: &str) -> Result<ColumnType, ColumnError> {
        if let Some(ty) = self.parsed.get(type_name) {
            return Ok(ty.value().clone());
        }
        let ty = ColumnType::parse_with(type_name, self)?;
        self.parsed.insert(type_name.to_owned(), ty.clone());
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn named_enum_resolution() {
        let registry = TypeRegistry::new();
        registry
            .register_enum("level", &["debug", "info", "error"])
            .unwrap();
        assert_matches!(
            registry.register_enum("level", &["x"]),
            Err(ColumnError::EnumAlreadyRegistered(name)) if name == "level"
        );

        let ty = registry.parse("Nullable(Enum8(level))").unwrap();
        let ColumnType::Nullable(inner) = &ty else {
            panic!("expected Nullable, got {ty}");
        };
        let ColumnType::Enum8(table) = inner.as_ref() else {
            panic!("expected Enum8, got {inner}");
        };
        assert_eq!(table.code("error"), Some(2));

        assert!(registry.parse("Enum8(unknown)").is_err());
        assert!(ColumnType::parse("Enum8(level)").is_err());
    }

    #[test]
    fn parse_is_cached() {
        let registry = TypeRegistry::new();
        let a = registry.parse("Array(UInt8)").unwrap();
        let b = registry.parse("Array(UInt8)").unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.parsed.len(), 1);
    }
}
