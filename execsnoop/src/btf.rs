//! Finds the `task_struct` field offsets the BPF object reads, in the running kernel's BTF.
//!
//! The BPF object is built without the kernel's type information, so the loader looks up
//! where `real_parent`, `tgid` and `exit_code` live and hands the offsets over as a global.

use std::{fs, path::Path};

use bytemuck::{Pod, Zeroable};
use execsnoop_common::TaskOffsets;
use thiserror::Error;

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

const BTF_MAGIC: u16 = 0xeb9f;

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_FLOAT: u32 = 16;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

#[derive(Debug, Error)]
pub enum BtfError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not a native-endian BTF blob")]
    BadMagic,
    #[error("BTF data truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown BTF kind {0}")]
    UnknownKind(u32),
    #[error("struct task_struct not found")]
    NoTaskStruct,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Header {
    magic: u16,
    version: u8,
    flags: u8,
    hdr_len: u32,
    type_off: u32,
    type_len: u32,
    str_off: u32,
    str_len: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Type {
    name_off: u32,
    info: u32,
    size_or_type: u32,
}

impl Type {
    fn kind(&self) -> u32 {
        (self.info >> 24) & 0x1f
    }

    fn vlen(&self) -> usize {
        (self.info & 0xffff) as usize
    }

    fn kflag(&self) -> bool {
        self.info >> 31 == 1
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Member {
    name_off: u32,
    type_id: u32,
    offset: u32,
}

fn read<T: Pod>(data: &[u8], at: usize) -> Result<T, BtfError> {
    let end = at
        .checked_add(size_of::<T>())
        .filter(|&end| end <= data.len())
        .ok_or(BtfError::Truncated(at))?;
    Ok(bytemuck::pod_read_unaligned(&data[at..end]))
}

/// The type section indexed by type id.
struct Types<'a> {
    types: &'a [u8],
    strings: &'a [u8],
    /// Byte position of each type, id 1 first.
    starts: Vec<usize>,
}

impl<'a> Types<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, BtfError> {
        let header: Header = read(data, 0)?;
        if header.magic != BTF_MAGIC {
            return Err(BtfError::BadMagic);
        }
        let section = |off: u32, len: u32| {
            let start = header.hdr_len as usize + off as usize;
            data.get(start..start + len as usize)
                .ok_or(BtfError::Truncated(start))
        };
        let types = section(header.type_off, header.type_len)?;
        let strings = section(header.str_off, header.str_len)?;

        let mut starts = Vec::new();
        let mut at = 0;
        while at < types.len() {
            let ty: Type = read(types, at)?;
            starts.push(at);
            at += size_of::<Type>() + trailer_len(&ty)?;
        }
        Ok(Self {
            types,
            strings,
            starts,
        })
    }

    fn get(&self, id: u32) -> Option<(Type, usize)> {
        let at = *self.starts.get((id as usize).checked_sub(1)?)?;
        let ty = read(self.types, at).ok()?;
        Some((ty, at + size_of::<Type>()))
    }

    fn name(&self, off: u32) -> &'a [u8] {
        let rest = self.strings.get(off as usize..).unwrap_or_default();
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        &rest[..end]
    }

    fn find_struct(&self, name: &str) -> Option<u32> {
        (1..=self.starts.len() as u32).find(|&id| {
            self.get(id).is_some_and(|(ty, _)| {
                ty.kind() == KIND_STRUCT && ty.vlen() > 0 && self.name(ty.name_off) == name.as_bytes()
            })
        })
    }

    /// Skips typedefs and qualifiers.
    fn resolve(&self, mut id: u32) -> Option<(Type, usize)> {
        for _ in 0..32 {
            let (ty, members) = self.get(id)?;
            match ty.kind() {
                KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT | KIND_TYPE_TAG => {
                    id = ty.size_or_type
                }
                _ => return Some((ty, members)),
            }
        }
        None
    }

    /// Bit offset of `name` within the struct or union `id`, looking through anonymous
    /// members.
    fn member_bits(&self, id: u32, name: &[u8]) -> Option<u32> {
        let (ty, at) = self.resolve(id)?;
        if !matches!(ty.kind(), KIND_STRUCT | KIND_UNION) {
            return None;
        }
        (0..ty.vlen()).find_map(|i| {
            let member: Member = read(self.types, at + i * size_of::<Member>()).ok()?;
            let bits = if ty.kflag() {
                member.offset & 0x00ff_ffff
            } else {
                member.offset
            };
            if member.name_off == 0 {
                self.member_bits(member.type_id, name)
                    .map(|inner| bits + inner)
            } else if self.name(member.name_off) == name {
                Some(bits)
            } else {
                None
            }
        })
    }
}

fn trailer_len(ty: &Type) -> Result<usize, BtfError> {
    let vlen = ty.vlen();
    Ok(match ty.kind() {
        KIND_INT | KIND_VAR | KIND_DECL_TAG => 4,
        KIND_ARRAY => 12,
        KIND_STRUCT | KIND_UNION | KIND_DATASEC | KIND_ENUM64 => vlen * 12,
        KIND_ENUM | KIND_FUNC_PROTO => vlen * 8,
        KIND_PTR | KIND_FWD | KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT
        | KIND_FUNC | KIND_FLOAT | KIND_TYPE_TAG => 0,
        kind => return Err(BtfError::UnknownKind(kind)),
    })
}

/// Offsets of the `task_struct` fields in a raw BTF blob. Fields that are missing stay 0.
pub fn task_offsets(data: &[u8]) -> Result<TaskOffsets, BtfError> {
    let types = Types::parse(data)?;
    let task = types.find_struct("task_struct").ok_or(BtfError::NoTaskStruct)?;
    let bytes = |name: &str| {
        types
            .member_bits(task, name.as_bytes())
            .map_or(0, |bits| bits / 8)
    };
    Ok(TaskOffsets {
        real_parent: bytes("real_parent"),
        tgid: bytes("tgid"),
        exit_code: bytes("exit_code"),
    })
}

pub fn read_task_offsets(path: &Path) -> Result<TaskOffsets, BtfError> {
    let data = fs::read(path).map_err(|source| BtfError::Io {
        path: path.display().to_string(),
        source,
    })?;
    task_offsets(&data)
}
