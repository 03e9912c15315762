//! Storage layouts and identity-keyed migration between them.

use std::collections::HashMap;
use std::sync::Arc;

use super::midi::MIDI_QUEUE_SIZE;
use crate::runtime::types::{GroupId, NodeKey};

/// Target facts the storage layout and the export tables depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pointer_bytes: u8,
    little_endian: bool,
}

impl DataLayout {
    pub fn new(pointer_bytes: u8, little_endian: bool) -> Self {
        Self {
            pointer_bytes,
            little_endian,
        }
    }

    pub fn pointer_bytes(&self) -> u32 {
        u32::from(self.pointer_bytes)
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Encodes a pointer-sized integer in target byte order.
    pub fn encode_usize(&self, value: u64, out: &mut Vec<u8>) {
        let bytes = if self.little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        let width = self.pointer_bytes as usize;
        if self.little_endian {
            out.extend_from_slice(&bytes[..width]);
        } else {
            out.extend_from_slice(&bytes[8 - width..]);
        }
    }

    pub fn size_of(&self, ty: &FieldType) -> u32 {
        match ty {
            FieldType::Num => 4,
            FieldType::Midi => MIDI_QUEUE_SIZE,
            FieldType::Struct(layout) => layout.size(),
        }
    }

    pub fn align_of(&self, ty: &FieldType) -> u32 {
        match ty {
            FieldType::Num | FieldType::Midi => 4,
            FieldType::Struct(layout) => layout.align(),
        }
    }
}

/// Identity of a storage field, stable across recompiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKey {
    Group(GroupId),
    State(NodeKey, &'static str),
    Child(NodeKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Num,
    Midi,
    Struct(Arc<StructLayout>),
}

impl FieldType {
    fn same_shape(&self, other: &FieldType) -> bool {
        matches!(
            (self, other),
            (FieldType::Num, FieldType::Num)
                | (FieldType::Midi, FieldType::Midi)
                | (FieldType::Struct(_), FieldType::Struct(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: FieldKey,
    pub ty: FieldType,
    /// Initial value of a `Num` field.
    pub default: f32,
}

impl Field {
    pub fn num(key: FieldKey, default: f32) -> Self {
        Self {
            key,
            ty: FieldType::Num,
            default,
        }
    }

    pub fn midi(key: FieldKey) -> Self {
        Self {
            key,
            ty: FieldType::Midi,
            default: 0.0,
        }
    }

    pub fn child(key: FieldKey, layout: Arc<StructLayout>) -> Self {
        Self {
            key,
            ty: FieldType::Struct(layout),
            default: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub field: Field,
    pub offset: u32,
}

/// A `repr(C)` style struct: fields in the given order, each aligned to its
/// natural alignment, total size rounded up to the struct alignment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructLayout {
    fields: Vec<FieldLayout>,
    index: HashMap<FieldKey, usize>,
    size: u32,
    align: u32,
}

impl StructLayout {
    pub fn build(data: &DataLayout, fields: impl IntoIterator<Item = Field>) -> Self {
        let mut layout = StructLayout {
            align: 4,
            ..StructLayout::default()
        };
        let mut offset = 0u32;
        for field in fields {
            let align = data.align_of(&field.ty);
            offset = offset.next_multiple_of(align);
            layout.align = layout.align.max(align);
            let size = data.size_of(&field.ty);
            layout
                .index
                .insert(field.key.clone(), layout.fields.len());
            layout.fields.push(FieldLayout { field, offset });
            offset += size;
        }
        layout.size = offset.next_multiple_of(layout.align);
        layout
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, key: &FieldKey) -> Option<&FieldLayout> {
        self.index.get(key).map(|&i| &self.fields[i])
    }

    pub fn offset_of(&self, key: &FieldKey) -> Option<u32> {
        self.field(key).map(|field| field.offset)
    }

    /// Fills `bytes` with every field's default. MIDI queues start empty.
    pub fn write_defaults(&self, bytes: &mut [u8]) {
        for field in &self.fields {
            let start = field.offset as usize;
            match &field.field.ty {
                FieldType::Num => {
                    bytes[start..start + 4].copy_from_slice(&field.field.default.to_ne_bytes());
                }
                FieldType::Midi => {
                    bytes[start..start + MIDI_QUEUE_SIZE as usize].fill(0);
                }
                FieldType::Struct(child) => {
                    child.write_defaults(&mut bytes[start..start + child.size() as usize]);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub preserved: usize,
    pub reset: usize,
}

impl std::ops::AddAssign for MigrationStats {
    fn add_assign(&mut self, other: Self) {
        self.preserved += other.preserved;
        self.reset += other.reset;
    }
}

/// Builds the contents of a new storage block from an old one.
///
/// Every field of `new` starts at its default. Fields whose key and type
/// also exist in `old` then receive the old bytes; embedded child structs
/// migrate recursively.
pub fn migrate(
    old: &StructLayout,
    old_bytes: &[u8],
    new: &StructLayout,
    new_bytes: &mut [u8],
) -> MigrationStats {
    new.write_defaults(new_bytes);
    let mut stats = MigrationStats::default();

    for field in new.fields() {
        let Some(previous) = old
            .field(&field.field.key)
            .filter(|previous| previous.field.ty.same_shape(&field.field.ty))
        else {
            stats.reset += 1;
            continue;
        };

        let from = previous.offset as usize;
        let to = field.offset as usize;
        match (&previous.field.ty, &field.field.ty) {
            (FieldType::Struct(old_child), FieldType::Struct(new_child)) => {
                stats += migrate(
                    old_child,
                    &old_bytes[from..from + old_child.size() as usize],
                    new_child,
                    &mut new_bytes[to..to + new_child.size() as usize],
                );
            }
            (FieldType::Num, _) => {
                new_bytes[to..to + 4].copy_from_slice(&old_bytes[from..from + 4]);
                stats.preserved += 1;
            }
            _ => {
                let len = MIDI_QUEUE_SIZE as usize;
                new_bytes[to..to + len].copy_from_slice(&old_bytes[from..from + len]);
                stats.preserved += 1;
            }
        }
    }
    stats
}
