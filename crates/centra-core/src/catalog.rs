// ── Device-kind field catalog ──
//
// Which canonical fields exist per device kind, and how wire spellings
// translate to them, is product data supplied by the embedding
// application -- the core only looks names up. Wire fields absent from
// the catalog are skipped, never guessed at.

use std::collections::HashMap;

use crate::model::DeviceKind;

#[derive(Debug, Clone, Default)]
struct KindFields {
    wire_to_canonical: HashMap<String, String>,
}

/// Externally supplied field-mapping table.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    /// Entity types in poll order.
    entity_types: Vec<String>,
    type_to_kind: HashMap<String, DeviceKind>,
    fields: HashMap<DeviceKind, KindFields>,
}

impl FieldCatalog {
    pub fn builder() -> FieldCatalogBuilder {
        FieldCatalogBuilder::default()
    }

    /// Entity types to poll, in registration order.
    pub fn entity_types(&self) -> &[String] {
        &self.entity_types
    }

    pub fn kind_for_entity(&self, entity_type: &str) -> Option<DeviceKind> {
        self.type_to_kind.get(entity_type).copied()
    }

    /// Translate a wire field spelling to its canonical name.
    pub fn canonical_field(&self, kind: DeviceKind, wire_name: &str) -> Option<&str> {
        self.fields
            .get(&kind)?
            .wire_to_canonical
            .get(wire_name)
            .map(String::as_str)
    }
}

/// Builder for [`FieldCatalog`].
#[derive(Debug, Default)]
pub struct FieldCatalogBuilder {
    catalog: FieldCatalog,
}

impl FieldCatalogBuilder {
    /// Register one entity type with its kind and wire→canonical field
    /// pairs.
    pub fn entity(mut self, entity_type: &str, kind: DeviceKind, fields: &[(&str, &str)]) -> Self {
        self.catalog.entity_types.push(entity_type.to_owned());
        self.catalog.type_to_kind.insert(entity_type.to_owned(), kind);

        let entry = self.catalog.fields.entry(kind).or_default();
        for (wire, canonical) in fields {
            entry
                .wire_to_canonical
                .insert((*wire).to_owned(), (*canonical).to_owned());
        }
        self
    }

    pub fn build(self) -> FieldCatalog {
        self.catalog
    }
}
