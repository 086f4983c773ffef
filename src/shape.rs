//! Output shapes and field-graph extraction
//!
//! An [`OutputShape`] describes which fields a response wants. It is usually derived from the
//! response struct with `#[derive(OutputShape)]`, but can be assembled by hand with
//! [`OutputShape::builder`]. [`extract`] flattens a shape into a [`FieldGraph`]: per level, the
//! scalar names requested and one child graph per nested relationship.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::SchemaError;

/// Accessor for a shape descriptor; shapes refer to each other through these
pub type ShapeRef = fn() -> &'static OutputShape;

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Scalar,
    Nested(ShapeRef),
}

#[derive(Debug, Clone)]
pub struct ShapeField {
    name: String,
    kind: FieldKind,
    lazy: bool,
}

impl ShapeField {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn nested(&self) -> Option<&'static OutputShape> {
        match self.kind {
            FieldKind::Nested(shape) => Some(shape()),
            FieldKind::Scalar => None,
        }
    }
}

/// A response projection: ordered fields, each terminal or nested
#[derive(Debug, Clone)]
pub struct OutputShape {
    name: String,
    fields: Vec<ShapeField>,
}

impl OutputShape {
    pub fn builder(name: impl Into<String>) -> OutputShapeBuilder {
        OutputShapeBuilder {
            shape: OutputShape {
                name: name.into(),
                fields: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[ShapeField] {
        &self.fields
    }
}

pub struct OutputShapeBuilder {
    shape: OutputShape,
}

impl OutputShapeBuilder {
    /// A field whose kind was resolved from its type
    pub fn field(mut self, name: impl Into<String>, nested: Option<ShapeRef>) -> Self {
        let kind = nested.map_or(FieldKind::Scalar, FieldKind::Nested);
        self.shape.fields.push(ShapeField {
            name: name.into(),
            kind,
            lazy: false,
        });
        self
    }

    pub fn scalar(self, name: impl Into<String>) -> Self {
        self.field(name, None)
    }

    pub fn nested(self, name: impl Into<String>, shape: ShapeRef) -> Self {
        self.field(name, Some(shape))
    }

    /// A field kept out of eager projection
    pub fn lazy(mut self, name: impl Into<String>) -> Self {
        self.shape.fields.push(ShapeField {
            name: name.into(),
            kind: FieldKind::Scalar,
            lazy: true,
        });
        self
    }

    pub fn build(self) -> OutputShape {
        self.shape
    }
}

/// Types with a static output shape, normally via `#[derive(OutputShape)]`
pub trait Shaped {
    fn output_shape() -> &'static OutputShape;
}

/// How a field's type contributes to a shape
///
/// Scalars return `None`; shaped types return their descriptor; containers delegate to their
/// element type. Implement it (with the default body) for custom scalar types, or mark the
/// field `#[shape(scalar)]`.
pub trait ShapeFieldType {
    fn nested_shape() -> Option<ShapeRef> {
        None
    }
}

macro_rules! scalar_field_types {
    ($($ty:ty),* $(,)?) => {
        $(impl ShapeFieldType for $ty {})*
    };
}

scalar_field_types!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    char,
    String,
    &'static str,
    uuid::Uuid,
    rust_decimal::Decimal,
    serde_json::Value,
    chrono::NaiveDate,
    chrono::NaiveTime,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::Utc>,
    chrono::DateTime<chrono::FixedOffset>,
);

impl<T: ShapeFieldType> ShapeFieldType for Option<T> {
    fn nested_shape() -> Option<ShapeRef> {
        T::nested_shape()
    }
}

impl<T: ShapeFieldType> ShapeFieldType for Vec<T> {
    fn nested_shape() -> Option<ShapeRef> {
        T::nested_shape()
    }
}

impl<T: ShapeFieldType> ShapeFieldType for Box<T> {
    fn nested_shape() -> Option<ShapeRef> {
        T::nested_shape()
    }
}

impl<T: ShapeFieldType> ShapeFieldType for BTreeSet<T> {
    fn nested_shape() -> Option<ShapeRef> {
        T::nested_shape()
    }
}

impl<T: ShapeFieldType, S> ShapeFieldType for HashSet<T, S> {
    fn nested_shape() -> Option<ShapeRef> {
        T::nested_shape()
    }
}

// Maps are opaque JSON objects as far as projection goes
impl<K, V> ShapeFieldType for BTreeMap<K, V> {}
impl<K, V, S> ShapeFieldType for HashMap<K, V, S> {}

/// Tree of requested names
///
/// Each level holds the flat scalar names (in first-seen order) and one child graph per
/// relationship prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldGraph {
    columns: Vec<String>,
    relationships: Vec<(String, FieldGraph)>,
}

/// A name used both as a scalar and as a relationship at one level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConflict(pub String);

impl FieldGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn relationships(&self) -> &[(String, FieldGraph)] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&FieldGraph> {
        self.relationships
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, graph)| graph)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.relationships.is_empty()
    }

    /// Add a dotted path; the part before the first `.` selects the child graph
    pub fn add_path(&mut self, path: &str) -> Result<(), PathConflict> {
        match path.split_once('.') {
            Some((head, rest)) => {
                if self.columns.iter().any(|c| c == head) {
                    return Err(PathConflict(head.to_string()));
                }
                let idx = match self.relationships.iter().position(|(key, _)| key == head) {
                    Some(idx) => idx,
                    None => {
                        self.relationships.push((head.to_string(), FieldGraph::default()));
                        self.relationships.len() - 1
                    }
                };
                self.relationships[idx].1.add_path(rest)
            }
            None => {
                if self.relationship(path).is_some() {
                    return Err(PathConflict(path.to_string()));
                }
                if !self.columns.iter().any(|c| c == path) {
                    self.columns.push(path.to_string());
                }
                Ok(())
            }
        }
    }
}

struct WorkItem<'a> {
    prefix: String,
    shape: &'a OutputShape,
    ancestry: Vec<*const OutputShape>,
}

/// Flatten `shape` into a [`FieldGraph`]
///
/// Lazy fields are skipped. A nested shape that is already being expanded on the current path
/// is not expanded again; nesting deeper than `max_depth` is an error.
pub fn extract(shape: &OutputShape, max_depth: usize) -> Result<FieldGraph, SchemaError> {
    let mut graph = FieldGraph::default();
    let mut worklist = VecDeque::from([WorkItem {
        prefix: String::new(),
        shape,
        ancestry: vec![shape as *const OutputShape],
    }]);

    while let Some(item) = worklist.pop_front() {
        check_field_kinds(item.shape)?;

        for field in item.shape.fields() {
            if field.is_lazy() {
                continue;
            }
            let path = format!("{}{}", item.prefix, field.name());
            match field.nested() {
                None => graph.add_path(&path).map_err(|PathConflict(name)| {
                    SchemaError::InconsistentShape {
                        shape: item.shape.name().to_string(),
                        field: name,
                    }
                })?,
                Some(nested) => {
                    let nested_ptr = nested as *const OutputShape;
                    if item.ancestry.contains(&nested_ptr) {
                        log::debug!(
                            "not expanding `{path}`: shape `{}` is already being expanded",
                            nested.name()
                        );
                        continue;
                    }
                    if item.ancestry.len() > max_depth {
                        return Err(SchemaError::ShapeTooDeep {
                            shape: shape.name().to_string(),
                            max_depth,
                        });
                    }
                    let mut ancestry = item.ancestry.clone();
                    ancestry.push(nested_ptr);
                    worklist.push_back(WorkItem {
                        prefix: format!("{path}."),
                        shape: nested,
                        ancestry,
                    });
                }
            }
        }
    }

    Ok(graph)
}

fn check_field_kinds(shape: &OutputShape) -> Result<(), SchemaError> {
    let mut seen: HashMap<&str, bool> = HashMap::new();
    for field in shape.fields().iter().filter(|f| !f.is_lazy()) {
        let nested = field.nested().is_some();
        if let Some(previous) = seen.insert(field.name(), nested) {
            if previous != nested {
                return Err(SchemaError::InconsistentShape {
                    shape: shape.name().to_string(),
                    field: field.name().to_string(),
                });
            }
        }
    }
    Ok(())
}
