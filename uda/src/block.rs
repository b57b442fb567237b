use paste::paste;

use crate::errors::{Result, UdaError};
use crate::io::{UdaRead, UdaWrite};
use crate::metadata::MetadataBlocks;
use crate::protocol::{
    write_header, ClientProperties, OpaqueType, ProtocolId, MAX_DATA_SIZE, MAX_RANK,
    MIN_VERSION_WITH_CACHE_PERMISSION, MIN_VERSION_WITH_TOTAL_BLOCK_SIZE,
};
use crate::structured::GeneralBlock;

/// Atomic element type of a data or dimension array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AtomicType {
    #[default]
    Unknown = 0,
    I8 = 1,
    U8 = 2,
    I16 = 3,
    U16 = 4,
    I32 = 5,
    U32 = 6,
    I64 = 7,
    U64 = 8,
    F32 = 9,
    F64 = 10,
    String = 11,
    /// Nested user-defined structure; the payload travels as an opaque tree.
    Compound = 12,
}

impl AtomicType {
    pub fn from_u32(i: u32) -> Result<Self> {
        Ok(match i {
            0 => AtomicType::Unknown,
            1 => AtomicType::I8,
            2 => AtomicType::U8,
            3 => AtomicType::I16,
            4 => AtomicType::U16,
            5 => AtomicType::I32,
            6 => AtomicType::U32,
            7 => AtomicType::I64,
            8 => AtomicType::U64,
            9 => AtomicType::F32,
            10 => AtomicType::F64,
            11 => AtomicType::String,
            12 => AtomicType::Compound,
            x => return Err(UdaError::Protocol(format!("invalid atomic type: {x}"))),
        })
    }

    /// Element size in bytes; 0 for variable-width and compound payloads.
    pub fn size(&self) -> usize {
        match self {
            AtomicType::Unknown | AtomicType::String | AtomicType::Compound => 0,
            AtomicType::I8 | AtomicType::U8 => 1,
            AtomicType::I16 | AtomicType::U16 => 2,
            AtomicType::I32 | AtomicType::U32 | AtomicType::F32 => 4,
            AtomicType::I64 | AtomicType::U64 | AtomicType::F64 => 8,
        }
    }
}

/// Tagged payload over the closed set of compound result carriers.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OpaqueBlock {
    #[default]
    None,
    XmlDocument(String),
    Structures(GeneralBlock),
    XdrFile(Vec<u8>),
    XdrObject(Vec<u8>),
    Efit(GeneralBlock),
}

impl OpaqueBlock {
    pub fn opaque_type(&self) -> OpaqueType {
        match self {
            OpaqueBlock::None => OpaqueType::Unknown,
            OpaqueBlock::XmlDocument(_) => OpaqueType::XmlDocument,
            OpaqueBlock::Structures(_) => OpaqueType::Structures,
            OpaqueBlock::XdrFile(_) => OpaqueType::XdrFile,
            OpaqueBlock::XdrObject(_) => OpaqueType::XdrObject,
            OpaqueBlock::Efit(_) => OpaqueType::Efit,
        }
    }
}

/// One dimension of a DataBlock: either a materialised coordinate array or a
/// compressed regular-grid descriptor expanded on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dim {
    pub data_type: AtomicType,
    pub n: u64,
    pub label: String,
    pub units: String,
    pub compressed: bool,
    /// Compression method; 0 is the regular grid `dim0 + i * diff`.
    pub method: u32,
    pub dim0: f64,
    pub diff: f64,
    /// Big-endian element bytes when materialised; empty while compressed.
    pub data: Vec<u8>,
    pub errhi: Vec<u8>,
    pub errlo: Vec<u8>,
}

impl Dim {
    pub fn materialised(data_type: AtomicType, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * data_type.size());
        for v in values {
            encode_element(&mut data, data_type, *v);
        }
        Dim {
            data_type,
            n: values.len() as u64,
            data,
            ..Default::default()
        }
    }

    pub fn compressed(data_type: AtomicType, n: u64, dim0: f64, diff: f64) -> Self {
        Dim {
            data_type,
            n,
            compressed: true,
            method: 0,
            dim0,
            diff,
            ..Default::default()
        }
    }

    /// Expands a compressed descriptor in place. A no-op for materialised
    /// dimensions.
    pub fn expand(&mut self) -> Result<()> {
        if !self.compressed {
            return Ok(());
        }
        if self.method != 0 {
            return Err(UdaError::Protocol(format!(
                "unsupported dimension compression method: {}",
                self.method
            )));
        }
        let mut data = Vec::with_capacity(self.n as usize * self.data_type.size());
        for i in 0..self.n {
            encode_element(&mut data, self.data_type, self.dim0 + i as f64 * self.diff);
        }
        self.data = data;
        self.compressed = false;
        Ok(())
    }

    /// Coordinate values as f64, expanding a compressed descriptor without
    /// mutating the dimension.
    pub fn values(&self) -> Result<Vec<f64>> {
        if self.compressed {
            if self.method != 0 {
                return Err(UdaError::Protocol(format!(
                    "unsupported dimension compression method: {}",
                    self.method
                )));
            }
            return Ok((0..self.n)
                .map(|i| self.dim0 + i as f64 * self.diff)
                .collect());
        }
        decode_elements_f64(&self.data, self.data_type)
    }

    async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_be(self.data_type as u32).await?;
        writer.write_u64_be(self.n).await?;
        writer.write_str(&self.label).await?;
        writer.write_str(&self.units).await?;
        writer.write_u8_byte(self.compressed as u8).await?;
        if self.compressed {
            writer.write_u32_be(self.method).await?;
            writer.write_f64_be(self.dim0).await?;
            writer.write_f64_be(self.diff).await?;
        } else {
            writer.write_bytes(&self.data).await?;
        }
        writer.write_bytes(&self.errhi).await?;
        writer.write_bytes(&self.errlo).await?;
        Ok(())
    }

    async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let data_type = AtomicType::from_u32(reader.read_u32_be().await?)?;
        let n = reader.read_u64_be().await?;
        let label = reader.read_str().await?;
        let units = reader.read_str().await?;
        let compressed = reader.read_u8_byte().await? != 0;
        let mut dim = Dim {
            data_type,
            n,
            label,
            units,
            compressed,
            ..Default::default()
        };
        if compressed {
            dim.method = reader.read_u32_be().await?;
            dim.dim0 = reader.read_f64_be().await?;
            dim.diff = reader.read_f64_be().await?;
        } else {
            dim.data = reader.read_bytes().await?;
            if dim.data.len() != dim.n as usize * data_type.size() {
                return Err(UdaError::Protocol(format!(
                    "dimension byte count {} disagrees with n={} of {:?}",
                    dim.data.len(),
                    dim.n,
                    data_type
                )));
            }
        }
        dim.errhi = reader.read_bytes().await?;
        dim.errlo = reader.read_bytes().await?;
        Ok(dim)
    }
}

fn encode_element(out: &mut Vec<u8>, data_type: AtomicType, value: f64) {
    match data_type {
        AtomicType::I8 => out.extend_from_slice(&(value as i8).to_be_bytes()),
        AtomicType::U8 => out.extend_from_slice(&(value as u8).to_be_bytes()),
        AtomicType::I16 => out.extend_from_slice(&(value as i16).to_be_bytes()),
        AtomicType::U16 => out.extend_from_slice(&(value as u16).to_be_bytes()),
        AtomicType::I32 => out.extend_from_slice(&(value as i32).to_be_bytes()),
        AtomicType::U32 => out.extend_from_slice(&(value as u32).to_be_bytes()),
        AtomicType::I64 => out.extend_from_slice(&(value as i64).to_be_bytes()),
        AtomicType::U64 => out.extend_from_slice(&(value as u64).to_be_bytes()),
        AtomicType::F32 => out.extend_from_slice(&(value as f32).to_be_bytes()),
        _ => out.extend_from_slice(&value.to_be_bytes()),
    }
}

fn decode_elements_f64(data: &[u8], data_type: AtomicType) -> Result<Vec<f64>> {
    let size = data_type.size();
    if size == 0 || data.len() % size != 0 {
        return Err(UdaError::Data {
            code: 1,
            message: format!("cannot decode {:?} array of {} bytes", data_type, data.len()),
        });
    }
    let out = data
        .chunks_exact(size)
        .map(|c| match data_type {
            AtomicType::I8 => c[0] as i8 as f64,
            AtomicType::U8 => c[0] as f64,
            AtomicType::I16 => i16::from_be_bytes([c[0], c[1]]) as f64,
            AtomicType::U16 => u16::from_be_bytes([c[0], c[1]]) as f64,
            AtomicType::I32 => i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64,
            AtomicType::U32 => u32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64,
            AtomicType::I64 => {
                i64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64
            }
            AtomicType::U64 => {
                u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64
            }
            AtomicType::F32 => f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64,
            _ => f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]),
        })
        .collect();
    Ok(out)
}

/// One result: header, raw data, dimensions, optional error arrays, optional
/// compound payload and metadata sidecars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataBlock {
    /// Index in the handle table; -1 while the slot is free.
    pub handle: i32,
    pub data_type: AtomicType,
    pub rank: u32,
    /// Element count of `data`.
    pub data_n: u64,
    /// Index of the time dimension, or -1.
    pub order: i32,
    pub errcode: i32,
    pub error_msg: String,
    pub source_status: i32,
    pub signal_status: i32,
    pub data_label: String,
    pub data_units: String,
    pub data_desc: String,
    /// Big-endian element bytes, `data_n` elements of `data_type`.
    pub data: Vec<u8>,
    pub errhi: Vec<u8>,
    pub errlo: Vec<u8>,
    pub synthetic: Vec<u8>,
    pub dims: Vec<Dim>,
    pub properties: ClientProperties,
    pub cache_permission: bool,
    pub opaque: OpaqueBlock,
    /// Catalog sidecars, attached client-side when metadata was requested.
    pub metadata: Option<Box<MetadataBlocks>>,
}

macro_rules! typed_accessors {
    ($($ty:ty => $tag:expr),* $(,)?) => {
        $(
            paste! {
                impl DataBlock {
                    /// Decodes the data array as this element type.
                    pub fn [<data_ $ty>](&self) -> Result<Vec<$ty>> {
                        if self.data_type != $tag {
                            return Err(UdaError::Data {
                                code: 1,
                                message: format!(
                                    "data is {:?}, not {}", self.data_type, stringify!($ty)
                                ),
                            });
                        }
                        Ok(self
                            .data
                            .chunks_exact(std::mem::size_of::<$ty>())
                            .map(|c| <$ty>::from_be_bytes(c.try_into().unwrap()))
                            .collect())
                    }

                    /// Replaces the data array with these elements.
                    pub fn [<set_data_ $ty>](&mut self, values: &[$ty]) {
                        self.data_type = $tag;
                        self.data_n = values.len() as u64;
                        self.data = values.iter().flat_map(|v| v.to_be_bytes()).collect();
                    }
                }
            }
        )*
    };
}

typed_accessors! {
    i8 => AtomicType::I8,
    u8 => AtomicType::U8,
    i16 => AtomicType::I16,
    u16 => AtomicType::U16,
    i32 => AtomicType::I32,
    u32 => AtomicType::U32,
    i64 => AtomicType::I64,
    u64 => AtomicType::U64,
    f32 => AtomicType::F32,
    f64 => AtomicType::F64,
}

impl DataBlock {
    pub fn new() -> Self {
        DataBlock {
            handle: -1,
            order: -1,
            ..Default::default()
        }
    }

    /// A scalar string result, used by function plugins.
    pub fn from_string(text: &str) -> Self {
        let mut block = DataBlock::new();
        block.data_type = AtomicType::String;
        block.data_n = text.len() as u64;
        block.data = text.as_bytes().to_vec();
        block
    }

    pub fn data_string(&self) -> Result<String> {
        if self.data_type != AtomicType::String {
            return Err(UdaError::Data {
                code: 1,
                message: format!("data is {:?}, not a string", self.data_type),
            });
        }
        String::from_utf8(self.data.clone()).map_err(|e| UdaError::Data {
            code: 1,
            message: format!("invalid utf-8 in string data: {e}"),
        })
    }

    /// Effective status: the signal status unless only the source carries one.
    pub fn status(&self) -> i32 {
        if self.signal_status != 0 {
            self.signal_status
        } else {
            self.source_status
        }
    }

    /// `data_n == product(dims.n)` for ranked atomic results.
    pub fn validate_shape(&self) -> Result<()> {
        if self.rank as usize != self.dims.len() {
            return Err(UdaError::Protocol(format!(
                "rank {} disagrees with {} dimensions",
                self.rank,
                self.dims.len()
            )));
        }
        if self.rank > MAX_RANK as u32 {
            return Err(UdaError::Protocol(format!(
                "rank {} exceeds the maximum {MAX_RANK}",
                self.rank
            )));
        }
        if self.rank > 0 && self.opaque == OpaqueBlock::None {
            let product: u64 = self.dims.iter().map(|d| d.n).product();
            if product != self.data_n {
                return Err(UdaError::Protocol(format!(
                    "data_n {} disagrees with dimension product {}",
                    self.data_n, product
                )));
            }
        }
        Ok(())
    }

    /// Drops all heap held by the slot and marks it free.
    pub fn reset(&mut self) {
        *self = DataBlock::new();
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::DataBlock, negotiated).await?;
        writer.write_u32_be(self.data_type as u32).await?;
        writer
            .write_u32_be(self.opaque.opaque_type() as u32)
            .await?;
        writer.write_u32_be(self.rank).await?;
        writer.write_u64_be(self.data_n).await?;
        writer.write_i32_be(self.order).await?;
        writer.write_i32_be(self.errcode).await?;
        writer.write_str(&self.error_msg).await?;
        writer.write_i32_be(self.source_status).await?;
        writer.write_i32_be(self.signal_status).await?;
        writer.write_str(&self.data_label).await?;
        writer.write_str(&self.data_units).await?;
        writer.write_str(&self.data_desc).await?;
        writer.write_bytes(&self.data).await?;
        writer.write_bytes(&self.errhi).await?;
        writer.write_bytes(&self.errlo).await?;
        writer.write_bytes(&self.synthetic).await?;
        for dim in &self.dims {
            dim.write(writer).await?;
        }
        if negotiated >= MIN_VERSION_WITH_CACHE_PERMISSION {
            writer.write_u8_byte(self.cache_permission as u8).await?;
        }
        if negotiated >= MIN_VERSION_WITH_TOTAL_BLOCK_SIZE {
            writer.write_u64_be(self.total_size()).await?;
        }
        Ok(())
    }

    /// Decodes the body after the header; the opaque payload (if any) arrives
    /// in a follow-up message and is attached by the session layer.
    pub async fn read<R: UdaRead>(reader: &mut R, negotiated: u32) -> Result<(Self, OpaqueType)> {
        let data_type = AtomicType::from_u32(reader.read_u32_be().await?)?;
        let opaque_type = OpaqueType::from_u32(reader.read_u32_be().await?)?;
        let rank = reader.read_u32_be().await?;
        if rank > MAX_RANK as u32 {
            return Err(UdaError::Protocol(format!(
                "rank {rank} exceeds the maximum {MAX_RANK}"
            )));
        }
        let data_n = reader.read_u64_be().await?;
        let order = reader.read_i32_be().await?;
        let errcode = reader.read_i32_be().await?;
        let error_msg = reader.read_str().await?;
        let source_status = reader.read_i32_be().await?;
        let signal_status = reader.read_i32_be().await?;
        let data_label = reader.read_str().await?;
        let data_units = reader.read_str().await?;
        let data_desc = reader.read_str().await?;
        let data = reader.read_bytes().await?;
        if data.len() > MAX_DATA_SIZE {
            return Err(UdaError::Protocol("data block too large".to_string()));
        }
        let errhi = reader.read_bytes().await?;
        let errlo = reader.read_bytes().await?;
        let synthetic = reader.read_bytes().await?;
        let mut dims = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            dims.push(Dim::read(reader).await?);
        }
        let cache_permission = if negotiated >= MIN_VERSION_WITH_CACHE_PERMISSION {
            reader.read_u8_byte().await? != 0
        } else {
            false
        };
        if negotiated >= MIN_VERSION_WITH_TOTAL_BLOCK_SIZE {
            let _advisory_size = reader.read_u64_be().await?;
        }
        let block = DataBlock {
            handle: -1,
            data_type,
            rank,
            data_n,
            order,
            errcode,
            error_msg,
            source_status,
            signal_status,
            data_label,
            data_units,
            data_desc,
            data,
            errhi,
            errlo,
            synthetic,
            dims,
            properties: ClientProperties::default(),
            cache_permission,
            opaque: OpaqueBlock::None,
            metadata: None,
        };
        if opaque_type == OpaqueType::Unknown {
            block.validate_shape()?;
        }
        Ok((block, opaque_type))
    }

    fn total_size(&self) -> u64 {
        let dim_bytes: usize = self
            .dims
            .iter()
            .map(|d| d.data.len() + d.errhi.len() + d.errlo.len())
            .sum();
        (self.data.len() + self.errhi.len() + self.errlo.len() + self.synthetic.len() + dim_bytes)
            as u64
    }
}
