use std::collections::BTreeMap;

use glam::{DVec3, IVec3};
use serde::Serialize;

use crate::codec::{ByteReader, ByteWriter};
use crate::error::{corrupt_data, unsupported, VdbResult};

/// Grid name used when the metadata does not carry one
pub const DEFAULT_GRID_NAME: &str = "density";

/// Key holding the grid name
pub const NAME_KEY: &str = "name";

const TAG_STRING: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_VEC3I: u8 = 4;
const TAG_VEC3D: u8 = 5;

/// Typed metadata value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Vec3i(IVec3),
    Vec3d(DVec3),
}

impl MetaValue {
    fn tag(&self) -> u8 {
        match self {
            MetaValue::String(_) => TAG_STRING,
            MetaValue::Int(_) => TAG_INT,
            MetaValue::Float(_) => TAG_FLOAT,
            MetaValue::Bool(_) => TAG_BOOL,
            MetaValue::Vec3i(_) => TAG_VEC3I,
            MetaValue::Vec3d(_) => TAG_VEC3D,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::String(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<IVec3> for MetaValue {
    fn from(value: IVec3) -> Self {
        MetaValue::Vec3i(value)
    }
}

impl From<DVec3> for MetaValue {
    fn from(value: DVec3) -> Self {
        MetaValue::Vec3d(value)
    }
}

/// Named attributes attached to a grid, kept in key order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<String, MetaValue>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes a viewer expects on a fog volume in micrometres
    pub fn for_density_grid(name: &str) -> Self {
        let mut metadata = Self::new();
        metadata.insert(NAME_KEY, name);
        metadata.insert("class", "fog volume");
        metadata.insert("voxel_units", "um");
        metadata.insert("value_name", "density");
        metadata
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.entries.remove(key)
    }

    /// Grid name, falling back to the default
    pub fn grid_name(&self) -> &str {
        self.get(NAME_KEY)
            .and_then(MetaValue::as_str)
            .unwrap_or(DEFAULT_GRID_NAME)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            writer.put_str(key);
            writer.put_u8(value.tag());
            match value {
                MetaValue::String(s) => writer.put_str(s),
                MetaValue::Int(v) => writer.put_i64(*v),
                MetaValue::Float(v) => writer.put_f64(*v),
                MetaValue::Bool(v) => writer.put_u8(u8::from(*v)),
                MetaValue::Vec3i(v) => {
                    for c in v.to_array() {
                        writer.put_i32(c);
                    }
                }
                MetaValue::Vec3d(v) => {
                    for c in v.to_array() {
                        writer.put_f64(c);
                    }
                }
            }
        }
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> VdbResult<Self> {
        let count = reader.get_u32()?;
        let mut metadata = Self::new();
        let mut previous: Option<String> = None;

        for _ in 0..count {
            let key = reader.get_str()?;
            if previous.as_deref().is_some_and(|p| p >= key.as_str()) {
                return Err(corrupt_data(format!("metadata key {:?} is out of order", key)));
            }

            let value = match reader.get_u8()? {
                TAG_STRING => MetaValue::String(reader.get_str()?),
                TAG_INT => MetaValue::Int(reader.get_i64()?),
                TAG_FLOAT => MetaValue::Float(reader.get_f64()?),
                TAG_BOOL => match reader.get_u8()? {
                    0 => MetaValue::Bool(false),
                    1 => MetaValue::Bool(true),
                    other => return Err(corrupt_data(format!("invalid bool byte {}", other))),
                },
                TAG_VEC3I => MetaValue::Vec3i(IVec3::new(
                    reader.get_i32()?,
                    reader.get_i32()?,
                    reader.get_i32()?,
                )),
                TAG_VEC3D => MetaValue::Vec3d(DVec3::new(
                    reader.get_f64()?,
                    reader.get_f64()?,
                    reader.get_f64()?,
                )),
                other => {
                    return Err(unsupported(format!(
                        "unknown metadata type tag {} for key {:?}",
                        other, key
                    )))
                }
            };

            metadata.entries.insert(key.clone(), value);
            previous = Some(key);
        }
        Ok(metadata)
    }
}
