use indexmap::IndexMap;

use crate::block::AtomicType;
use crate::errors::{Result, UdaError};
use crate::io::{UdaRead, UdaWrite};
use crate::protocol::{write_header, ProtocolId, MAX_RANK};

/// Which backend serves a request. File-format readers carry the resolved
/// format name in `RequestBlock::format`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestKind {
    #[default]
    Unknown = 0,
    /// Catalog lookup; the database identifies the target.
    Generic = 1,
    /// File-format reader selected by format/extension/magic.
    File = 2,
    /// Server-side function library.
    ServerSide = 3,
    /// External function-library plugin.
    FunctionLib = 4,
    /// Forward to a peer server without interpretation.
    Forward = 5,
    Mds = 6,
    Sql = 7,
    Web = 8,
}

impl RequestKind {
    pub fn from_u32(i: u32) -> Result<Self> {
        Ok(match i {
            0 => RequestKind::Unknown,
            1 => RequestKind::Generic,
            2 => RequestKind::File,
            3 => RequestKind::ServerSide,
            4 => RequestKind::FunctionLib,
            5 => RequestKind::Forward,
            6 => RequestKind::Mds,
            7 => RequestKind::Sql,
            8 => RequestKind::Web,
            x => return Err(UdaError::Protocol(format!("invalid request kind: {x}"))),
        })
    }
}

/// Expanded per-dimension slice instructions. `stop == -1` means "to end";
/// `count == -1` is the matching open count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSubset {
    pub rank: usize,
    pub start: Vec<i32>,
    pub stop: Vec<i32>,
    pub count: Vec<i32>,
    pub stride: Vec<i32>,
    /// True where the dimension is actually constrained.
    pub subset_flag: Vec<bool>,
}

impl DataSubset {
    pub fn is_empty(&self) -> bool {
        self.rank == 0
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_be(self.rank as u32).await?;
        for i in 0..self.rank {
            writer.write_i32_be(self.start[i]).await?;
            writer.write_i32_be(self.stop[i]).await?;
            writer.write_i32_be(self.count[i]).await?;
            writer.write_i32_be(self.stride[i]).await?;
            writer.write_u8_byte(self.subset_flag[i] as u8).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let rank = reader.read_u32_be().await? as usize;
        if rank > MAX_RANK {
            return Err(UdaError::Protocol(format!(
                "subset rank {rank} exceeds the maximum {MAX_RANK}"
            )));
        }
        let mut subset = DataSubset {
            rank,
            ..Default::default()
        };
        for _ in 0..rank {
            subset.start.push(reader.read_i32_be().await?);
            subset.stop.push(reader.read_i32_be().await?);
            subset.count.push(reader.read_i32_be().await?);
            subset.stride.push(reader.read_i32_be().await?);
            subset.subset_flag.push(reader.read_u8_byte().await? != 0);
        }
        Ok(subset)
    }
}

/// One parsed argument. `quoted` records whether enclosing quotes were
/// stripped from the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameValue {
    pub name: String,
    pub value: String,
    pub quoted: bool,
}

/// Ordered argument list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameValueList {
    pairs: IndexMap<String, NameValue>,
}

impl NameValueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str, quoted: bool) {
        self.pairs.insert(
            name.to_lowercase(),
            NameValue {
                name: name.to_string(),
                value: value.to_string(),
                quoted,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&NameValue> {
        self.pairs.get(&name.to_lowercase())
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|nv| nv.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &NameValue> {
        self.pairs.values()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_be(self.pairs.len() as u32).await?;
        for nv in self.pairs.values() {
            writer.write_str(&nv.name).await?;
            writer.write_str(&nv.value).await?;
            writer.write_u8_byte(nv.quoted as u8).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u32_be().await?;
        let mut list = NameValueList::new();
        for _ in 0..count {
            let name = reader.read_str().await?;
            let value = reader.read_str().await?;
            let quoted = reader.read_u8_byte().await? != 0;
            list.insert(&name, &value, quoted);
        }
        Ok(list)
    }
}

/// One named payload travelling with a put request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutDataBlock {
    pub name: String,
    pub data_type: AtomicType,
    pub rank: u32,
    pub shape: Vec<u32>,
    pub count: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutDataBlockList {
    pub blocks: Vec<PutDataBlock>,
}

impl PutDataBlockList {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::PutdataBlockList, negotiated).await?;
        writer.write_u32_be(self.blocks.len() as u32).await?;
        for block in &self.blocks {
            writer.write_str(&block.name).await?;
            writer.write_u32_be(block.data_type as u32).await?;
            writer.write_u32_be(block.rank).await?;
            for extent in &block.shape {
                writer.write_u32_be(*extent).await?;
            }
            writer.write_u64_be(block.count).await?;
            writer.write_bytes(&block.data).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u32_be().await? as usize;
        let mut list = PutDataBlockList::default();
        for _ in 0..count {
            let name = reader.read_str().await?;
            let data_type = AtomicType::from_u32(reader.read_u32_be().await?)?;
            let rank = reader.read_u32_be().await?;
            if rank > MAX_RANK as u32 {
                return Err(UdaError::Protocol(format!(
                    "put block rank {rank} exceeds the maximum {MAX_RANK}"
                )));
            }
            let mut shape = Vec::with_capacity(rank as usize);
            for _ in 0..rank {
                shape.push(reader.read_u32_be().await?);
            }
            let element_count = reader.read_u64_be().await?;
            let data = reader.read_bytes().await?;
            if data_type.size() != 0 && data.len() != element_count as usize * data_type.size() {
                return Err(UdaError::Protocol(format!(
                    "put block '{name}' carries {} bytes for {element_count} elements",
                    data.len()
                )));
            }
            list.blocks.push(PutDataBlock {
                name,
                data_type,
                rank,
                shape,
                count: element_count,
                data,
            });
        }
        Ok(list)
    }
}

/// The structured form of one client request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestBlock {
    pub kind: RequestKind,
    pub device: String,
    pub archive: String,
    pub format: String,
    pub file: String,
    pub path: String,
    pub server: String,
    pub function: String,
    pub exp_number: i32,
    pub pass: i32,
    pub tpass: String,
    pub signal: String,
    /// The (possibly rewritten) source string as parsed.
    pub source: String,
    /// Captured slice expression, verbatim.
    pub subset_text: String,
    pub subset: DataSubset,
    pub name_values: NameValueList,
    pub put: bool,
    pub put_data: PutDataBlockList,
    pub api_delim: String,
}

impl RequestBlock {
    pub fn new() -> Self {
        RequestBlock {
            pass: -1,
            ..Default::default()
        }
    }

    /// The put payload list travels as its own message; only the direction
    /// flag is part of the request schema.
    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::RequestBlock, negotiated).await?;
        writer.write_u32_be(self.kind as u32).await?;
        writer.write_str(&self.device).await?;
        writer.write_str(&self.archive).await?;
        writer.write_str(&self.format).await?;
        writer.write_str(&self.file).await?;
        writer.write_str(&self.path).await?;
        writer.write_str(&self.server).await?;
        writer.write_str(&self.function).await?;
        writer.write_i32_be(self.exp_number).await?;
        writer.write_i32_be(self.pass).await?;
        writer.write_str(&self.tpass).await?;
        writer.write_str(&self.signal).await?;
        writer.write_str(&self.source).await?;
        writer.write_str(&self.subset_text).await?;
        self.subset.write(writer).await?;
        self.name_values.write(writer).await?;
        writer.write_u8_byte(self.put as u8).await?;
        writer.write_str(&self.api_delim).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        Ok(RequestBlock {
            kind: RequestKind::from_u32(reader.read_u32_be().await?)?,
            device: reader.read_str().await?,
            archive: reader.read_str().await?,
            format: reader.read_str().await?,
            file: reader.read_str().await?,
            path: reader.read_str().await?,
            server: reader.read_str().await?,
            function: reader.read_str().await?,
            exp_number: reader.read_i32_be().await?,
            pass: reader.read_i32_be().await?,
            tpass: reader.read_str().await?,
            signal: reader.read_str().await?,
            source: reader.read_str().await?,
            subset_text: reader.read_str().await?,
            subset: DataSubset::read(reader).await?,
            name_values: NameValueList::read(reader).await?,
            put: reader.read_u8_byte().await? != 0,
            put_data: PutDataBlockList::default(),
            api_delim: reader.read_str().await?,
        })
    }

    /// Renders the canonical `(signal, source)` pair this block parses back
    /// from. Used by the result cache fingerprint and round-trip tests.
    pub fn render(&self) -> (String, String) {
        let delim = if self.api_delim.is_empty() {
            "::"
        } else {
            &self.api_delim
        };
        let mut signal = String::new();
        if !self.archive.is_empty() {
            signal.push_str(&self.archive);
            signal.push_str(delim);
        }
        signal.push_str(&self.signal);
        signal.push_str(&self.subset_text);

        let args = || {
            self.name_values
                .iter()
                .map(|nv| {
                    if nv.quoted {
                        format!("{}='{}'", nv.name, nv.value)
                    } else if nv.name == nv.value {
                        nv.name.clone()
                    } else {
                        format!("{}={}", nv.name, nv.value)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let source = match self.kind {
            RequestKind::Generic => {
                if self.exp_number == 0 && self.pass < 0 && self.tpass.is_empty() {
                    String::new()
                } else if self.pass >= 0 {
                    format!("{}/{}", self.exp_number, self.pass)
                } else if !self.tpass.is_empty() {
                    format!("{}/{}", self.exp_number, self.tpass)
                } else {
                    format!("{}", self.exp_number)
                }
            }
            RequestKind::File => format!("{}{delim}{}", self.format, self.path),
            RequestKind::ServerSide | RequestKind::FunctionLib => {
                format!("{}{delim}{}({})", self.format, self.function, args())
            }
            RequestKind::Mds => format!(
                "MDS+{delim}{}/{}/{}",
                self.server, self.file, self.exp_number
            ),
            RequestKind::Forward => format!("UDA{delim}{}/{}", self.server, self.file),
            RequestKind::Web => format!("WEB{delim}{}/{}", self.server, self.file),
            RequestKind::Sql => format!("SQL{delim}{}/{}", self.server, self.path),
            RequestKind::Unknown => self.source.clone(),
        };
        (signal, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{expect_header, CLIENT_VERSION};

    #[tokio::test]
    async fn request_block_round_trips() {
        let mut rb = RequestBlock::new();
        rb.kind = RequestKind::Generic;
        rb.exp_number = 12345;
        rb.archive = "UDA".to_string();
        rb.signal = "ip".to_string();
        rb.api_delim = "::".to_string();
        rb.name_values.insert("verbose", "true", false);
        rb.subset = DataSubset {
            rank: 1,
            start: vec![0],
            stop: vec![99],
            count: vec![50],
            stride: vec![2],
            subset_flag: vec![true],
        };
        rb.subset_text = "[0:99:2]".to_string();

        let mut buf = Vec::new();
        rb.write(&mut buf, CLIENT_VERSION).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::RequestBlock)
            .await
            .unwrap();
        let decoded = RequestBlock::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, rb);
    }

    #[tokio::test]
    async fn put_list_round_trips_and_checks_counts() {
        let mut list = PutDataBlockList::default();
        list.blocks.push(PutDataBlock {
            name: "profile".to_string(),
            data_type: AtomicType::F64,
            rank: 1,
            shape: vec![3],
            count: 3,
            data: [1.0f64, 2.0, 3.0]
                .iter()
                .flat_map(|v| v.to_be_bytes())
                .collect(),
        });

        let mut buf = Vec::new();
        list.write(&mut buf, CLIENT_VERSION).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::PutdataBlockList)
            .await
            .unwrap();
        let decoded = PutDataBlockList::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn name_value_lookup_is_case_insensitive() {
        let mut list = NameValueList::new();
        list.insert("Delimiter", ";", true);
        assert_eq!(list.value("delimiter"), Some(";"));
        assert!(list.get("DELIMITER").unwrap().quoted);
    }
}
