//! Datatypes and resolution of discovered items to them.

use std::fmt;

use serde_json::Value;

use crate::error::KiraError;
use crate::item::{Field, FileGroup, Item, extension_of};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Integer,
    Decimal,
    Text,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatatypeKind {
    FileSet {
        /// Extension of the primary file, e.g. `.nii.gz`. `None` accepts any
        /// group as is.
        primary: Option<String>,
        side_cars: Vec<String>,
        directory: bool,
    },
    Field {
        scalar: ScalarKind,
        array: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datatype {
    pub name: String,
    pub kind: DatatypeKind,
}

impl Datatype {
    pub fn file_set(name: &str, primary: &str, side_cars: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: DatatypeKind::FileSet {
                primary: Some(primary.to_string()),
                side_cars: side_cars.iter().map(|ext| ext.to_string()).collect(),
                directory: false,
            },
        }
    }

    pub fn directory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DatatypeKind::FileSet {
                primary: None,
                side_cars: Vec::new(),
                directory: true,
            },
        }
    }

    pub fn generic() -> Self {
        Self {
            name: "fileset".to_string(),
            kind: DatatypeKind::FileSet {
                primary: None,
                side_cars: Vec::new(),
                directory: false,
            },
        }
    }

    pub fn field(name: &str, scalar: ScalarKind, array: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: DatatypeKind::Field { scalar, array },
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self.kind, DatatypeKind::Field { .. })
    }

    /// A copy of `item` narrowed to this datatype, or `None` if the item
    /// cannot be read as one.
    pub fn resolve(&self, item: &Item) -> Option<Item> {
        let mut resolved = match (&self.kind, item) {
            (
                DatatypeKind::FileSet {
                    primary,
                    side_cars,
                    directory,
                },
                Item::FileGroup(group),
            ) => Item::FileGroup(resolve_files(group, primary.as_deref(), side_cars, *directory)?),
            (DatatypeKind::Field { scalar, array }, Item::Field(field)) => {
                Item::Field(resolve_field(field, *scalar, *array)?)
            }
            _ => return None,
        };
        resolved.meta_mut().datatype = Some(self.name.clone());
        Some(resolved)
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn resolve_files(
    group: &FileGroup,
    primary: Option<&str>,
    side_cars: &[String],
    directory: bool,
) -> Option<FileGroup> {
    if group.is_dir != directory {
        return None;
    }
    let Some(primary) = primary else {
        return Some(group.clone());
    };
    let primary_file = group
        .files
        .iter()
        .find(|file| extension_of(file) == primary)?;
    let mut files = vec![primary_file.clone()];
    for side_car in side_cars {
        if let Some(file) = group
            .files
            .iter()
            .find(|file| extension_of(file) == side_car)
        {
            files.push(file.clone());
        }
    }
    Some(FileGroup {
        meta: group.meta.clone(),
        files,
        is_dir: group.is_dir,
    })
}

fn resolve_field(field: &Field, scalar: ScalarKind, array: bool) -> Option<Field> {
    let value = match &field.value {
        None => None,
        Some(value) if array => {
            let elements = match value {
                Value::Array(elements) => elements.clone(),
                Value::String(text) => text
                    .trim_matches(|ch| ch == '[' || ch == ']')
                    .split(',')
                    .map(|part| Value::String(part.trim().to_string()))
                    .filter(|part| part.as_str() != Some(""))
                    .collect(),
                _ => return None,
            };
            Some(Value::Array(
                elements
                    .iter()
                    .map(|element| coerce(element, scalar))
                    .collect::<Option<Vec<_>>>()?,
            ))
        }
        Some(value) => Some(coerce(value, scalar)?),
    };
    Some(Field {
        meta: field.meta.clone(),
        value,
    })
}

fn coerce(value: &Value, scalar: ScalarKind) -> Option<Value> {
    match (scalar, value) {
        (ScalarKind::Integer, Value::Number(number)) => number.as_i64().map(Value::from),
        (ScalarKind::Integer, Value::String(text)) => {
            text.trim().parse::<i64>().ok().map(Value::from)
        }
        (ScalarKind::Decimal, Value::Number(number)) => number.as_f64().map(Value::from),
        (ScalarKind::Decimal, Value::String(text)) => {
            text.trim().parse::<f64>().ok().map(Value::from)
        }
        (ScalarKind::Text, Value::String(_)) => Some(value.clone()),
        (ScalarKind::Text, Value::Number(number)) => Some(Value::String(number.to_string())),
        (ScalarKind::Text, Value::Bool(flag)) => Some(Value::String(flag.to_string())),
        (ScalarKind::Boolean, Value::Bool(_)) => Some(value.clone()),
        (ScalarKind::Boolean, Value::String(text)) => match text.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

pub fn register(registry: &mut Registry<Datatype, ()>) {
    registry.register("fileset", |_| Ok(Datatype::generic()));
    registry.register("directory", |_| Ok(Datatype::directory("directory")));
    registry.register("dicom", |_| Ok(Datatype::directory("dicom")));
    registry.register("text_file", |_| Ok(Datatype::file_set("text_file", ".txt", &[])));
    registry.register("json", |_| Ok(Datatype::file_set("json", ".json", &[])));
    registry.register("nifti", |_| Ok(Datatype::file_set("nifti", ".nii", &[])));
    registry.register("nifti_gz", |_| {
        Ok(Datatype::file_set("nifti_gz", ".nii.gz", &[]))
    });
    registry.register("nifti_gz_x", |_| {
        Ok(Datatype::file_set("nifti_gz_x", ".nii.gz", &[".json"]))
    });
    for (name, scalar) in [
        ("integer", ScalarKind::Integer),
        ("decimal", ScalarKind::Decimal),
        ("text", ScalarKind::Text),
        ("boolean", ScalarKind::Boolean),
    ] {
        registry.register(name, move |_| Ok(Datatype::field(name, scalar, false)));
        let key = format!("{name}_array");
        let array_name = key.clone();
        registry.register(&key, move |_| Ok(Datatype::field(&array_name, scalar, true)));
    }
}

pub fn datatypes() -> Registry<Datatype, ()> {
    let mut registry = Registry::new("datatype");
    register(&mut registry);
    registry
}

pub fn lookup(name: &str) -> Result<Datatype, KiraError> {
    datatypes().create(name, &())
}
