//! Type catalog: attribute layout of every node type.
//!
//! The catalog is loaded once and shared read-only for the life of the
//! process. It decides which child scalars propagate into a parent's
//! adjacency rows and how each attribute's sort key is built.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::storage::{sortkey, ScalarValue};
use crate::types::{GraphError, Result, SortKey};

/// Default partition for attributes that do not name one.
pub const DEFAULT_PARTITION: &str = "A";

/// Kind of data an attribute holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Boolean scalar.
    Bool,
    /// Integer scalar.
    Int,
    /// Float scalar.
    Float,
    /// String scalar.
    String,
    /// Binary scalar.
    Bytes,
    /// Uid-predicate: edges to nodes of the attribute's target type.
    Uid,
}

impl DataKind {
    /// True for every kind except [`DataKind::Uid`].
    pub fn is_scalar(self) -> bool {
        !matches!(self, DataKind::Uid)
    }

    /// Whether `value` is of this kind.
    pub fn accepts(self, value: &ScalarValue) -> bool {
        matches!(
            (self, value),
            (DataKind::Bool, ScalarValue::Bool(_))
                | (DataKind::Int, ScalarValue::Int(_))
                | (DataKind::Float, ScalarValue::Float(_) | ScalarValue::Int(_))
                | (DataKind::String, ScalarValue::Str(_))
                | (DataKind::Bytes, ScalarValue::Bytes(_))
        )
    }

    /// Parses the textual form used by the CLI loaders.
    pub fn parse_value(self, text: &str) -> Result<ScalarValue> {
        match self {
            DataKind::Bool => text
                .parse()
                .map(ScalarValue::Bool)
                .map_err(|_| GraphError::Invalid("expected a boolean")),
            DataKind::Int => text
                .parse()
                .map(ScalarValue::Int)
                .map_err(|_| GraphError::Invalid("expected an integer")),
            DataKind::Float => text
                .parse()
                .map(ScalarValue::Float)
                .map_err(|_| GraphError::Invalid("expected a float")),
            DataKind::String => Ok(ScalarValue::Str(text.to_string())),
            DataKind::Bytes => hex::decode(text)
                .map(ScalarValue::Bytes)
                .map_err(|_| GraphError::Invalid("expected hex bytes")),
            DataKind::Uid => Err(GraphError::Invalid("uid-predicates have no scalar value")),
        }
    }
}

fn default_partition() -> String {
    DEFAULT_PARTITION.to_string()
}

fn default_true() -> bool {
    true
}

/// One attribute of a type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDef {
    /// Attribute name as used by callers.
    pub name: String,
    /// Data kind.
    pub kind: DataKind,
    /// Short code embedded in sort keys and reverse-edge markers.
    pub short: String,
    /// Sort-key partition.
    #[serde(default = "default_partition")]
    pub partition: String,
    /// Copy this scalar into parents' adjacency rows.
    #[serde(default)]
    pub propagate: bool,
    /// Absent values are allowed.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Child type of a uid-predicate.
    #[serde(default)]
    pub target: Option<String>,
}

impl AttrDef {
    /// Scalar attribute in the default partition.
    pub fn scalar(name: &str, short: &str, kind: DataKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            short: short.to_string(),
            partition: default_partition(),
            propagate: false,
            nullable: true,
            target: None,
        }
    }

    /// Uid-predicate pointing at nodes of type `target`.
    pub fn uid_pred(name: &str, short: &str, target: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            ..Self::scalar(name, short, DataKind::Uid)
        }
    }

    /// Marks the attribute as propagated.
    pub fn propagated(mut self) -> Self {
        self.propagate = true;
        self
    }

    /// Marks the attribute as required.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sort key of this attribute's row on its owner.
    pub fn sort_key(&self) -> SortKey {
        if self.kind.is_scalar() {
            sortkey::scalar(&self.partition, &self.short)
        } else {
            sortkey::adjacency(&self.partition, &self.short)
        }
    }
}

/// A node type and its attributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Type name.
    pub name: String,
    /// Type short code.
    pub short: String,
    /// Attributes in declaration order.
    #[serde(default)]
    pub attrs: Vec<AttrDef>,
}

impl TypeDef {
    /// Type with no attributes.
    pub fn new(name: &str, short: &str) -> Self {
        Self {
            name: name.to_string(),
            short: short.to_string(),
            attrs: Vec::new(),
        }
    }

    /// Appends an attribute.
    pub fn attr(mut self, attr: AttrDef) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Attribute by name.
    pub fn attribute(&self, name: &str) -> Result<&AttrDef> {
        self.attrs
            .iter()
            .find(|attr| attr.name == name)
            .ok_or_else(|| GraphError::AttributeNotFound {
                ty: self.name.clone(),
                attr: name.to_string(),
            })
    }

    /// Scalars flagged for propagation, in declaration order.
    pub fn propagated(&self) -> impl Iterator<Item = &AttrDef> {
        self.attrs
            .iter()
            .filter(|attr| attr.propagate && attr.kind.is_scalar())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    types: Vec<TypeDef>,
}

/// Immutable set of type definitions.
#[derive(Clone, Debug, Default)]
pub struct TypeCatalog {
    types: FxHashMap<String, TypeDef>,
}

impl TypeCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type after validating it.
    pub fn with_type(mut self, ty: TypeDef) -> Result<Self> {
        self.insert(ty)?;
        Ok(self)
    }

    fn insert(&mut self, ty: TypeDef) -> Result<()> {
        if self.types.contains_key(&ty.name) {
            return Err(GraphError::Invalid("duplicate type name"));
        }
        for (idx, attr) in ty.attrs.iter().enumerate() {
            if ty.attrs[..idx]
                .iter()
                .any(|other| other.name == attr.name || other.sort_key() == attr.sort_key())
            {
                return Err(GraphError::Invalid("duplicate attribute name or short code"));
            }
            if attr.kind == DataKind::Uid && attr.target.is_none() {
                return Err(GraphError::Invalid("uid-predicate without target type"));
            }
            if attr.short.contains(['#', '%', ':']) || attr.short.is_empty() {
                return Err(GraphError::Invalid("short code may not be empty or contain # % :"));
            }
        }
        self.types.insert(ty.name.clone(), ty);
        Ok(())
    }

    /// Parses a catalog from TOML (`[[types]]` tables with `[[types.attrs]]`).
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, ConfigError> {
        let raw: RawCatalog =
            toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: None,
                source,
            })?;
        let mut catalog = Self::new();
        for ty in raw.types {
            catalog
                .insert(ty)
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        }
        Ok(catalog)
    }

    /// Reads and parses a catalog file.
    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|err| err.with_path(path))
    }

    /// Type by name.
    pub fn get(&self, name: &str) -> Result<&TypeDef> {
        self.types
            .get(name)
            .ok_or_else(|| GraphError::TypeNotFound(name.to_string()))
    }

    /// Uid-predicate `predicate` of type `ty`.
    pub fn uid_predicate(&self, ty: &str, predicate: &str) -> Result<&AttrDef> {
        let def = self.get(ty)?;
        let attr = def.attribute(predicate)?;
        if attr.kind != DataKind::Uid {
            return Err(GraphError::Invalid("attribute is not a uid-predicate"));
        }
        Ok(attr)
    }

    /// Number of types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when no types are defined.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
