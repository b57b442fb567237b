//! User-defined compound results. The sender ships a type dictionary then a
//! value tree; pointers inside the tree are indices into a single logged
//! arena, so cycles and shared substructures survive the wire and can be
//! released deterministically.

use indexmap::IndexMap;
use log::trace;

use crate::block::AtomicType;
use crate::errors::{Result, UdaError};
use crate::io::{UdaRead, UdaWrite};
use crate::protocol::{write_header, ProtocolId};

pub const MAX_COMPOUND_FIELDS: usize = 256;
pub const MAX_COMPOUND_NODES: usize = 1 << 20;

/// One member of a user-defined type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompoundField {
    pub name: String,
    pub type_name: String,
    pub atomic: AtomicType,
    pub is_pointer: bool,
    pub rank: u32,
    pub shape: Vec<u32>,
    /// Element count; the product of `shape` when ranked.
    pub count: u64,
    pub offset: u64,
    pub alignment: u32,
}

impl CompoundField {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_str(&self.name).await?;
        writer.write_str(&self.type_name).await?;
        writer.write_u32_be(self.atomic as u32).await?;
        writer.write_u8_byte(self.is_pointer as u8).await?;
        writer.write_u32_be(self.rank).await?;
        for extent in &self.shape {
            writer.write_u32_be(*extent).await?;
        }
        writer.write_u64_be(self.count).await?;
        writer.write_u64_be(self.offset).await?;
        writer.write_u32_be(self.alignment).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let name = reader.read_str().await?;
        let type_name = reader.read_str().await?;
        let atomic = AtomicType::from_u32(reader.read_u32_be().await?)?;
        let is_pointer = reader.read_u8_byte().await? != 0;
        let rank = reader.read_u32_be().await?;
        if rank as usize > crate::protocol::MAX_RANK {
            return Err(UdaError::Protocol(format!(
                "compound field rank {rank} exceeds the maximum"
            )));
        }
        let mut shape = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            shape.push(reader.read_u32_be().await?);
        }
        let count = reader.read_u64_be().await?;
        let offset = reader.read_u64_be().await?;
        let alignment = reader.read_u32_be().await?;
        Ok(CompoundField {
            name,
            type_name,
            atomic,
            is_pointer,
            rank,
            shape,
            count,
            offset,
            alignment,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserDefinedType {
    pub name: String,
    pub size: u64,
    pub fields: Vec<CompoundField>,
}

impl UserDefinedType {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_str(&self.name).await?;
        writer.write_u64_be(self.size).await?;
        writer.write_u32_be(self.fields.len() as u32).await?;
        for field in &self.fields {
            field.write(writer).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let name = reader.read_str().await?;
        let size = reader.read_u64_be().await?;
        let count = reader.read_u32_be().await? as usize;
        if count > MAX_COMPOUND_FIELDS {
            return Err(UdaError::Protocol(format!(
                "compound type '{name}' has too many fields: {count}"
            )));
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(CompoundField::read(reader).await?);
        }
        Ok(UserDefinedType { name, size, fields })
    }
}

/// Registered compound schemas, keyed case-insensitively by name and kept in
/// registration order for the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserDefinedTypeList {
    types: IndexMap<String, UserDefinedType>,
}

impl UserDefinedTypeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, udt: UserDefinedType) {
        self.types.insert(udt.name.to_lowercase(), udt);
    }

    pub fn find(&self, name: &str) -> Option<&UserDefinedType> {
        self.types.get(&name.to_lowercase())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.types.get_index_of(&name.to_lowercase())
    }

    pub fn get(&self, index: usize) -> Option<&UserDefinedType> {
        self.types.get_index(index).map(|(_, udt)| udt)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_be(self.types.len() as u32).await?;
        for udt in self.types.values() {
            udt.write(writer).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u32_be().await? as usize;
        if count > MAX_COMPOUND_FIELDS {
            return Err(UdaError::Protocol(format!(
                "type dictionary too large: {count}"
            )));
        }
        let mut list = UserDefinedTypeList::new();
        for _ in 0..count {
            list.register(UserDefinedType::read(reader).await?);
        }
        Ok(list)
    }
}

/// One member value inside a node. Pointer fields hold a 1-based node index;
/// 0 is the null pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Big-endian element bytes of the field's atomic type.
    Atomic(Vec<u8>),
    Str(String),
    Pointer(Option<u32>),
}

/// One materialised structure instance in the arena.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructNode {
    pub type_index: u32,
    pub fields: Vec<FieldValue>,
}

/// Record of one arena materialisation; free walks this in reverse.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocEntry {
    pub node: u32,
    pub count: u64,
    pub element_size: u64,
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocLog {
    entries: Vec<AllocEntry>,
}

impl AllocLog {
    pub fn record(&mut self, node: u32, count: u64, element_size: u64, type_name: &str) {
        self.entries.push(AllocEntry {
            node,
            count,
            element_size,
            type_name: type_name.to_string(),
        });
    }

    pub fn entries(&self) -> &[AllocEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A complete compound result: dictionary, arena, allocation log and the
/// root node. Attached to a DataBlock as its opaque payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneralBlock {
    pub types: UserDefinedTypeList,
    pub nodes: Vec<StructNode>,
    pub alloc_log: AllocLog,
    pub root: u32,
}

impl GeneralBlock {
    pub fn new(types: UserDefinedTypeList) -> Self {
        GeneralBlock {
            types,
            ..Default::default()
        }
    }

    /// Adds a node to the arena, logging the materialisation, and returns its
    /// index.
    pub fn push_node(&mut self, node: StructNode) -> Result<u32> {
        let (type_name, type_size, schema_fields) = {
            let udt = self.types.get(node.type_index as usize).ok_or_else(|| {
                UdaError::Protocol(format!("unknown type index {}", node.type_index))
            })?;
            (udt.name.clone(), udt.size, udt.fields.len())
        };
        if node.fields.len() != schema_fields {
            return Err(UdaError::Protocol(format!(
                "node of type '{type_name}' carries {} fields, schema has {schema_fields}",
                node.fields.len()
            )));
        }
        let index = self.nodes.len() as u32;
        self.alloc_log.record(index, 1, type_size, &type_name);
        self.nodes.push(node);
        Ok(index)
    }

    pub fn node(&self, index: u32) -> Option<&StructNode> {
        self.nodes.get(index as usize)
    }

    /// Follows a pointer field of a node.
    pub fn deref(&self, pointer: &FieldValue) -> Result<Option<&StructNode>> {
        match pointer {
            FieldValue::Pointer(None) => Ok(None),
            FieldValue::Pointer(Some(target)) => self
                .nodes
                .get(*target as usize)
                .map(Some)
                .ok_or_else(|| UdaError::Protocol(format!("dangling pointer to node {target}"))),
            _ => Err(UdaError::Protocol("field is not a pointer".to_string())),
        }
    }

    /// Releases the arena, walking the allocation log in reverse.
    pub fn free(&mut self) {
        for entry in self.alloc_log.entries.iter().rev() {
            if let Some(node) = self.nodes.get_mut(entry.node as usize) {
                node.fields.clear();
            }
        }
        self.nodes.clear();
        self.alloc_log.clear();
        self.root = 0;
    }

    pub async fn write<W: UdaWrite>(
        &self,
        writer: &mut W,
        negotiated: u32,
        id: ProtocolId,
    ) -> Result<()> {
        write_header(writer, id, negotiated).await?;
        self.types.write(writer).await?;
        writer.write_u32_be(self.nodes.len() as u32).await?;
        for node in &self.nodes {
            let udt = self.types.get(node.type_index as usize).ok_or_else(|| {
                UdaError::Protocol(format!("unknown type index {}", node.type_index))
            })?;
            writer.write_u32_be(node.type_index).await?;
            for (field, schema) in node.fields.iter().zip(&udt.fields) {
                match field {
                    FieldValue::Pointer(target) => {
                        if !schema.is_pointer {
                            return Err(UdaError::Protocol(format!(
                                "field '{}' is not a pointer in the schema",
                                schema.name
                            )));
                        }
                        writer.write_u32_be(target.map(|t| t + 1).unwrap_or(0)).await?;
                    }
                    FieldValue::Str(s) => writer.write_str(s).await?,
                    FieldValue::Atomic(bytes) => writer.write_bytes(bytes).await?,
                }
            }
        }
        writer.write_u32_be(self.root).await?;
        Ok(())
    }

    /// Decodes the body after the header. Every node materialisation is
    /// logged so the receiver can rebuild and later release pointer graphs
    /// without walking them.
    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let types = UserDefinedTypeList::read(reader).await?;
        let node_count = reader.read_u32_be().await? as usize;
        if node_count > MAX_COMPOUND_NODES {
            return Err(UdaError::Protocol(format!(
                "compound arena too large: {node_count} nodes"
            )));
        }
        let mut block = GeneralBlock::new(types);
        for index in 0..node_count {
            let type_index = reader.read_u32_be().await?;
            let udt = block
                .types
                .get(type_index as usize)
                .ok_or_else(|| UdaError::Protocol(format!("unknown type index {type_index}")))?
                .clone();
            let mut fields = Vec::with_capacity(udt.fields.len());
            for schema in &udt.fields {
                if schema.is_pointer {
                    let raw = reader.read_u32_be().await?;
                    let target = if raw == 0 { None } else { Some(raw - 1) };
                    if let Some(t) = target {
                        if t as usize >= node_count {
                            return Err(UdaError::Protocol(format!(
                                "pointer to node {t} outside the arena of {node_count}"
                            )));
                        }
                    }
                    fields.push(FieldValue::Pointer(target));
                } else if schema.atomic == AtomicType::String {
                    fields.push(FieldValue::Str(reader.read_str().await?));
                } else {
                    let bytes = reader.read_bytes().await?;
                    let want = schema.count as usize * schema.atomic.size();
                    if bytes.len() != want {
                        return Err(UdaError::Protocol(format!(
                            "field '{}' carries {} bytes, schema wants {want}",
                            schema.name,
                            bytes.len()
                        )));
                    }
                    fields.push(FieldValue::Atomic(bytes));
                }
            }
            block.alloc_log.record(index as u32, 1, udt.size, &udt.name);
            block.nodes.push(StructNode { type_index, fields });
        }
        block.root = reader.read_u32_be().await?;
        if node_count > 0 && block.root as usize >= node_count {
            return Err(UdaError::Protocol(format!(
                "root node {} outside the arena",
                block.root
            )));
        }
        trace!(
            "compound tree received: {} types, {} nodes",
            block.types.len(),
            block.nodes.len()
        );
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{expect_header, CLIENT_VERSION};

    fn coil_schema() -> UserDefinedTypeList {
        let mut types = UserDefinedTypeList::new();
        types.register(UserDefinedType {
            name: "Coil".to_string(),
            size: 24,
            fields: vec![
                CompoundField {
                    name: "turns".to_string(),
                    type_name: "int".to_string(),
                    atomic: AtomicType::I32,
                    count: 1,
                    ..Default::default()
                },
                CompoundField {
                    name: "label".to_string(),
                    type_name: "string".to_string(),
                    atomic: AtomicType::String,
                    count: 1,
                    ..Default::default()
                },
                CompoundField {
                    name: "next".to_string(),
                    type_name: "Coil".to_string(),
                    atomic: AtomicType::Compound,
                    is_pointer: true,
                    count: 1,
                    ..Default::default()
                },
            ],
        });
        types
    }

    fn coil(turns: i32, label: &str, next: Option<u32>) -> StructNode {
        StructNode {
            type_index: 0,
            fields: vec![
                FieldValue::Atomic(turns.to_be_bytes().to_vec()),
                FieldValue::Str(label.to_string()),
                FieldValue::Pointer(next),
            ],
        }
    }

    #[tokio::test]
    async fn cyclic_graph_round_trips() {
        let mut block = GeneralBlock::new(coil_schema());
        // Two nodes pointing at each other.
        block.push_node(coil(12, "P1", Some(1))).unwrap();
        block.push_node(coil(8, "P2", Some(0))).unwrap();
        block.root = 0;

        let mut buf = Vec::new();
        block
            .write(&mut buf, CLIENT_VERSION, ProtocolId::Structures)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::Structures)
            .await
            .unwrap();
        let decoded = GeneralBlock::read(&mut cursor).await.unwrap();

        assert_eq!(decoded.nodes.len(), 2);
        assert_eq!(decoded.alloc_log.len(), 2);
        let root = decoded.node(decoded.root).unwrap();
        let next = decoded.deref(&root.fields[2]).unwrap().unwrap();
        assert_eq!(next.fields[1], FieldValue::Str("P2".to_string()));
        // The cycle closes back on the root.
        let back = decoded.deref(&next.fields[2]).unwrap().unwrap();
        assert_eq!(back.fields[1], FieldValue::Str("P1".to_string()));
    }

    #[tokio::test]
    async fn dangling_pointer_is_rejected() {
        let mut block = GeneralBlock::new(coil_schema());
        block.push_node(coil(3, "stray", Some(7))).unwrap();

        let mut buf = Vec::new();
        block
            .write(&mut buf, CLIENT_VERSION, ProtocolId::Structures)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::Structures)
            .await
            .unwrap();
        assert!(GeneralBlock::read(&mut cursor).await.is_err());
    }

    #[test]
    fn free_walks_the_log_in_reverse() {
        let mut block = GeneralBlock::new(coil_schema());
        block.push_node(coil(1, "a", None)).unwrap();
        block.push_node(coil(2, "b", Some(0))).unwrap();
        assert_eq!(block.alloc_log.len(), 2);
        block.free();
        assert!(block.nodes.is_empty());
        assert!(block.alloc_log.is_empty());
    }
}
