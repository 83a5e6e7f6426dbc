//! Column type metadata carried alongside a plan fragment.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::codec::{WireReader, WireWriter};

/// Semantic data type of an output column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
    Text,
    Timestamp,
    Date,
    Blob,
    String,
}

impl DataType {
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Boolean => 0,
            Self::Int32 => 1,
            Self::Int64 => 2,
            Self::Float => 3,
            Self::Double => 4,
            Self::Text => 5,
            Self::Timestamp => 8,
            Self::Date => 9,
            Self::Blob => 10,
            Self::String => 11,
        }
    }

    pub fn from_i8(value: i8) -> anyhow::Result<Self> {
        Ok(match value {
            0 => Self::Boolean,
            1 => Self::Int32,
            2 => Self::Int64,
            3 => Self::Float,
            4 => Self::Double,
            5 => Self::Text,
            8 => Self::Timestamp,
            9 => Self::Date,
            10 => Self::Blob,
            11 => Self::String,
            other => anyhow::bail!("unknown data type {other}"),
        })
    }
}

/// Scan direction over the time column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanOrder {
    #[default]
    Asc,
    Desc,
}

impl ScanOrder {
    pub(crate) fn encode(self, out: &mut WireWriter) {
        out.put_u8(match self {
            Self::Asc => 0,
            Self::Desc => 1,
        });
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        match reader.read_u8()? {
            0 => Ok(Self::Asc),
            1 => Ok(Self::Desc),
            other => anyhow::bail!("unknown scan order {other}"),
        }
    }
}

/// Name and type of one measurement in a device template.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementSchema {
    pub name: String,
    pub data_type: DataType,
}

impl MeasurementSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Scan shape shared by every device of one template.
///
/// When present, aligned scans encode only their device and region; the rest
/// of their attributes is rebuilt from this payload on decode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplatedInfo {
    pub measurements: Vec<MeasurementSchema>,
    pub scan_order: ScanOrder,
    pub limit: i64,
    pub offset: i64,
    pub query_all_sensors: bool,
    /// Aggregation functions applied by templated aggregation scans.
    pub aggregations: Vec<String>,
}

impl TemplatedInfo {
    pub fn new(measurements: Vec<MeasurementSchema>) -> Self {
        Self {
            measurements,
            scan_order: ScanOrder::Asc,
            limit: 0,
            offset: 0,
            query_all_sensors: false,
            aggregations: Vec::new(),
        }
    }

    pub fn measurement_names(&self) -> Vec<String> {
        self.measurements.iter().map(|m| m.name.clone()).collect()
    }

    fn encode(&self, out: &mut WireWriter) {
        out.put_i32(self.measurements.len() as i32);
        for schema in &self.measurements {
            out.put_str(&schema.name);
            out.put_i8(schema.data_type.as_i8());
        }
        self.scan_order.encode(out);
        out.put_i64(self.limit);
        out.put_i64(self.offset);
        out.put_bool(self.query_all_sensors);
        out.put_i32(self.aggregations.len() as i32);
        for aggregation in &self.aggregations {
            out.put_str(aggregation);
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        let count = reader.read_len()?;
        let mut measurements = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.read_string()?;
            let data_type = DataType::from_i8(reader.read_i8()?)?;
            measurements.push(MeasurementSchema { name, data_type });
        }
        let scan_order = ScanOrder::decode(reader)?;
        let limit = reader.read_i64()?;
        let offset = reader.read_i64()?;
        let query_all_sensors = reader.read_bool()?;
        let aggregation_count = reader.read_len()?;
        let mut aggregations = Vec::with_capacity(aggregation_count);
        for _ in 0..aggregation_count {
            aggregations.push(reader.read_string()?);
        }
        Ok(Self {
            measurements,
            scan_order,
            limit,
            offset,
            query_all_sensors,
            aggregations,
        })
    }
}

/// Output column name to data type mapping for a plan or fragment.
///
/// Entries are kept ordered so equal providers always encode to equal bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeProvider {
    types: BTreeMap<String, DataType>,
    templated_info: Option<TemplatedInfo>,
}

impl TypeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_templated_info(mut self, info: TemplatedInfo) -> Self {
        self.templated_info = Some(info);
        self
    }

    pub fn set_type(&mut self, column: impl Into<String>, data_type: DataType) {
        self.types.insert(column.into(), data_type);
    }

    pub fn get_type(&self, column: &str) -> Option<DataType> {
        self.types.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.types.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DataType)> {
        self.types.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn templated_info(&self) -> Option<&TemplatedInfo> {
        self.templated_info.as_ref()
    }

    pub fn is_templated(&self) -> bool {
        self.templated_info.is_some()
    }

    /// Narrow this provider to the given columns, keeping the templated info.
    pub fn extract_for<'a, I>(&self, columns: I) -> TypeProvider
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: BTreeSet<&str> = columns.into_iter().collect();
        let types = self
            .types
            .iter()
            .filter(|(name, _)| wanted.contains(name.as_str()))
            .map(|(name, data_type)| (name.clone(), *data_type))
            .collect();
        TypeProvider {
            types,
            templated_info: self.templated_info.clone(),
        }
    }

    pub fn encode(&self, out: &mut WireWriter) {
        out.put_i32(self.types.len() as i32);
        for (name, data_type) in &self.types {
            out.put_str(name);
            out.put_i8(data_type.as_i8());
        }
        match &self.templated_info {
            Some(info) => {
                out.put_bool(true);
                info.encode(out);
            }
            None => out.put_bool(false),
        }
    }

    pub fn decode(reader: &mut WireReader<'_>) -> anyhow::Result<Self> {
        let count = reader.read_len()?;
        let mut types = BTreeMap::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let data_type = DataType::from_i8(reader.read_i8()?)?;
            types.insert(name, data_type);
        }
        let templated_info = if reader.read_bool()? {
            Some(TemplatedInfo::decode(reader)?)
        } else {
            None
        };
        Ok(Self {
            types,
            templated_info,
        })
    }
}
