//! Type registry, fact shape conformance and derived fact identifiers.
//!
//! The registry is filled while a program compiles and read-only afterwards.
//! It answers field-type lookups for the checker and conforms incoming facts
//! to their declared shape at network entry.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::ast::TypeDefinition;
use crate::error::DataError;
use crate::types::{BaseType, Fact, ID_FIELD, Value};

/// Separates the type name from the key part of a derived identifier.
pub const ID_TYPE_SEPARATOR: char = '~';

/// Separates primary-key values inside a derived identifier.
pub const ID_VALUE_SEPARATOR: char = '_';

/// Length of the hash part of a hash-derived identifier.
pub const ID_HASH_LENGTH: usize = 16;

/// Name to type-definition map.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDefinition>,
}

impl TypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one of the same name.
    pub fn register(&mut self, definition: TypeDefinition) -> Option<TypeDefinition> {
        self.types.insert(definition.name.clone(), definition)
    }

    /// Look up a definition.
    pub fn get(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    /// Whether the type is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Declared type names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// Every definition, sorted by name.
    pub fn definitions(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.values()
    }

    /// Number of declared types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Drop every definition.
    pub fn clear(&mut self) {
        self.types.clear();
    }

    /// Base type of `type_name.field`.
    ///
    /// `id` resolves to string even when not declared. `None` when the type
    /// or field is unknown, or the field carries an unknown type name.
    pub fn field_type(&self, type_name: &str, field: &str) -> Option<BaseType> {
        let definition = self.types.get(type_name)?;
        match definition.field(field) {
            Some(f) => BaseType::parse(&f.type_name),
            None if field == ID_FIELD => Some(BaseType::String),
            None => None,
        }
    }

    /// Conform a fact to its declared type.
    ///
    /// Returns `Ok(None)` for undeclared types, which no type node accepts.
    pub fn conform(&self, fact: &Fact) -> Result<Option<Fact>, DataError> {
        match self.types.get(&fact.type_name) {
            Some(definition) => conform_to(definition, fact).map(Some),
            None => Ok(None),
        }
    }

    /// Fill an empty identifier from the fact's type and values.
    pub fn assign_id(&self, fact: &mut Fact) -> Result<(), DataError> {
        if !fact.id.is_empty() {
            return Ok(());
        }
        fact.id = match self.types.get(&fact.type_name) {
            Some(definition) => generate_fact_id(definition, &fact.fields)?,
            None => hash_id(&fact.type_name, &fact.fields),
        };
        Ok(())
    }
}

/// Conform a fact to a type definition.
///
/// Every declared field must be present (a declared `id` field may be
/// satisfied by the fact identifier). Integral numbers are stored as
/// integers in integer fields; integers widen to numbers in number fields.
/// Undeclared fields are kept as they are.
pub fn conform_to(definition: &TypeDefinition, fact: &Fact) -> Result<Fact, DataError> {
    let mut conformed = fact.clone();
    for field in &definition.fields {
        let Some(base) = BaseType::parse(&field.type_name) else {
            return Err(invalid(
                fact,
                format!("field '{}' has unknown type '{}'", field.name, field.type_name),
            ));
        };
        let value = match fact.fields.get(&field.name) {
            Some(value) => value,
            None if field.name == ID_FIELD && base == BaseType::String => {
                conformed
                    .fields
                    .insert(ID_FIELD.to_string(), Value::String(fact.id.clone()));
                continue;
            }
            None => {
                return Err(invalid(fact, format!("missing field '{}'", field.name)));
            }
        };
        let coerced = coerce(value, base).ok_or_else(|| {
            invalid(
                fact,
                format!("field '{}' expects {}, got {}", field.name, base, value.base_type()),
            )
        })?;
        conformed.fields.insert(field.name.clone(), coerced);
    }
    Ok(conformed)
}

fn invalid(fact: &Fact, reason: String) -> DataError {
    DataError::InvalidFact {
        fact_id: fact.id.clone(),
        reason,
    }
}

/// Convert a value to the given base type, if it is representable.
pub fn coerce(value: &Value, base: BaseType) -> Option<Value> {
    match (base, value) {
        (BaseType::Integer, v) => v.as_i64().map(Value::Integer),
        (BaseType::Number, v) => v.as_f64().map(Value::Number),
        (BaseType::Boolean, Value::Boolean(b)) => Some(Value::Boolean(*b)),
        (BaseType::String, Value::String(s)) => Some(Value::String(s.clone())),
        _ => None,
    }
}

// =============================================================================
// Fact identifiers
// =============================================================================

/// Derive the identifier of a fact of the given type.
///
/// With a primary key: `Type~v1_v2` over the key fields in declaration order.
/// Without one: `Type~` followed by the first 16 hex characters of a SHA-256
/// over the sorted `name=value` pairs.
pub fn generate_fact_id(
    definition: &TypeDefinition,
    fields: &BTreeMap<String, Value>,
) -> Result<String, DataError> {
    let key = definition.primary_key();
    if key.is_empty() {
        let declared: BTreeMap<String, Value> = fields
            .iter()
            .filter(|(name, _)| definition.field(name).is_some())
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        return Ok(hash_id(&definition.name, &declared));
    }

    let mut parts = Vec::with_capacity(key.len());
    for field in key {
        let value = fields.get(&field.name).ok_or_else(|| DataError::InvalidFact {
            fact_id: String::new(),
            reason: format!(
                "primary key field '{}' of type '{}' is missing",
                field.name, definition.name
            ),
        })?;
        parts.push(escape_id_value(&value.to_plain_string()));
    }
    Ok(format!(
        "{}{}{}",
        definition.name,
        ID_TYPE_SEPARATOR,
        parts.join(&ID_VALUE_SEPARATOR.to_string())
    ))
}

fn hash_id(type_name: &str, fields: &BTreeMap<String, Value>) -> String {
    // BTreeMap iteration is already sorted by name.
    let joined = fields
        .iter()
        .map(|(name, value)| format!("{}={}", name, value.to_plain_string()))
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha256::digest(joined.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(ID_HASH_LENGTH);
    format!("{}{}{}", type_name, ID_TYPE_SEPARATOR, hash)
}

/// Escape a primary-key value for use inside an identifier.
pub fn escape_id_value(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace(ID_TYPE_SEPARATOR, "%7E")
        .replace(ID_VALUE_SEPARATOR, "%5F")
        .replace(' ', "%20")
}

/// Reverse of [`escape_id_value`].
pub fn unescape_id_value(value: &str) -> String {
    value
        .replace("%20", " ")
        .replace("%5F", "_")
        .replace("%7E", "~")
        .replace("%25", "%")
}

/// Decomposed derived identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFactId {
    /// Type name
    pub type_name: String,
    /// Primary-key values, or the hash as the single entry
    pub values: Vec<String>,
    /// Whether the key part is a content hash
    pub is_hash: bool,
}

/// Split a derived identifier into type name and key values.
pub fn parse_fact_id(id: &str) -> Result<ParsedFactId, DataError> {
    let bad = |reason: &str| DataError::InvalidFact {
        fact_id: id.to_string(),
        reason: reason.to_string(),
    };
    let (type_name, rest) = id
        .split_once(ID_TYPE_SEPARATOR)
        .ok_or_else(|| bad("identifier has no type separator"))?;
    if type_name.is_empty() {
        return Err(bad("identifier has an empty type name"));
    }
    if rest.is_empty() {
        return Err(bad("identifier has an empty key part"));
    }
    if rest.len() == ID_HASH_LENGTH && rest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(ParsedFactId {
            type_name: type_name.to_string(),
            values: vec![rest.to_string()],
            is_hash: true,
        });
    }
    Ok(ParsedFactId {
        type_name: type_name.to_string(),
        values: rest.split(ID_VALUE_SEPARATOR).map(unescape_id_value).collect(),
        is_hash: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FieldDefinition;

    fn create_test_registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register(TypeDefinition {
            name: "Person".into(),
            fields: vec![
                FieldDefinition::key("id", "string"),
                FieldDefinition::new("age", "integer"),
                FieldDefinition::new("score", "number"),
            ],
            position: None,
        });
        registry.register(TypeDefinition::new("Event", &[("kind", "string"), ("at", "integer")]));
        registry
    }

    #[test]
    fn test_field_type_lookup() {
        let registry = create_test_registry();
        assert_eq!(registry.field_type("Person", "age"), Some(BaseType::Integer));
        assert_eq!(registry.field_type("Event", "id"), Some(BaseType::String));
        assert_eq!(registry.field_type("Person", "missing"), None);
        assert_eq!(registry.field_type("Nope", "age"), None);
    }

    #[test]
    fn test_conform_coerces_numbers() {
        let registry = create_test_registry();
        let fact = Fact::new("P1", "Person")
            .field("id", "P1")
            .field("age", 25.0)
            .field("score", 7);
        let conformed = registry.conform(&fact).unwrap().unwrap();
        assert_eq!(conformed.fields["age"], Value::Integer(25));
        assert_eq!(conformed.fields["score"], Value::Number(7.0));
    }

    #[test]
    fn test_conform_rejects_bad_shapes() {
        let registry = create_test_registry();
        let fractional = Fact::new("P1", "Person").field("age", 25.5).field("score", 1.0);
        assert!(matches!(
            registry.conform(&fractional),
            Err(DataError::InvalidFact { .. })
        ));

        let missing = Fact::new("P2", "Person").field("score", 1.0);
        assert!(registry.conform(&missing).is_err());

        let wrong = Fact::new("E1", "Event").field("kind", 3).field("at", 1);
        assert!(registry.conform(&wrong).is_err());

        // The id field is satisfied by the fact identifier.
        let no_id = Fact::new("P3", "Person").field("age", 1).field("score", 1.0);
        let conformed = registry.conform(&no_id).unwrap().unwrap();
        assert_eq!(conformed.fields["id"], Value::from("P3"));

        let undeclared = Fact::new("X1", "Unknown");
        assert!(registry.conform(&undeclared).unwrap().is_none());
    }

    #[test]
    fn test_primary_key_id_round_trip() {
        let registry = create_test_registry();
        let mut fact = Fact::new("", "Person")
            .field("id", "a_b ~c%")
            .field("age", 1)
            .field("score", 0.5);
        registry.assign_id(&mut fact).unwrap();
        assert_eq!(fact.id, "Person~a%5Fb%20%7Ec%25");

        let parsed = parse_fact_id(&fact.id).unwrap();
        assert_eq!(parsed.type_name, "Person");
        assert_eq!(parsed.values, vec!["a_b ~c%"]);
        assert!(!parsed.is_hash);
    }

    #[test]
    fn test_hash_id_is_stable() {
        let registry = create_test_registry();
        let mut a = Fact::new("", "Event").field("kind", "click").field("at", 10);
        let mut b = Fact::new("", "Event").field("at", 10).field("kind", "click");
        registry.assign_id(&mut a).unwrap();
        registry.assign_id(&mut b).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("Event~"));

        let parsed = parse_fact_id(&a.id).unwrap();
        assert!(parsed.is_hash);
        assert_eq!(parsed.values[0].len(), ID_HASH_LENGTH);

        let mut explicit = Fact::new("E42", "Event");
        registry.assign_id(&mut explicit).unwrap();
        assert_eq!(explicit.id, "E42");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_fact_id("no-separator").is_err());
        assert!(parse_fact_id("~abc").is_err());
        assert!(parse_fact_id("Type~").is_err());
    }
}
