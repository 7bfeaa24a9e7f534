//! Kernel argument reflection.
//!
//! Compiled programs carry their argument-binding schema as non-semantic
//! reflection instructions inside the SPIR-V binary (the
//! `NonSemantic.ClspvReflection` extended instruction set). The reflector
//! walks the word stream twice: once to collect strings, integer
//! constants and the reflection import id, then once over the reflection
//! instructions themselves, resolving every operand through those tables.
//!
//! Output is a map from kernel name to its bindings, sorted by ordinal,
//! plus the compile-time required workgroup size where the kernel
//! declared one. Any structural defect in the binary is `CL_INVALID_BINARY`.

use std::collections::HashMap;

use crate::cl::{ClResult, CL_INVALID_BINARY};
use crate::geom::Size;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

// Core opcodes the reflector cares about.
const OP_STRING: u32 = 7;
const OP_EXT_INST_IMPORT: u32 = 11;
const OP_EXT_INST: u32 = 12;
const OP_CONSTANT: u32 = 43;

// NonSemantic.ClspvReflection instruction numbers.
const REFL_KERNEL: u32 = 1;
const REFL_ARGUMENT_INFO: u32 = 2;
const REFL_ARGUMENT_STORAGE_BUFFER: u32 = 3;
const REFL_ARGUMENT_UNIFORM: u32 = 4;
const REFL_ARGUMENT_POD_STORAGE_BUFFER: u32 = 5;
const REFL_ARGUMENT_POD_UNIFORM: u32 = 6;
const REFL_ARGUMENT_POD_PUSH_CONSTANT: u32 = 7;
const REFL_ARGUMENT_SAMPLED_IMAGE: u32 = 8;
const REFL_ARGUMENT_STORAGE_IMAGE: u32 = 9;
const REFL_ARGUMENT_SAMPLER: u32 = 10;
const REFL_ARGUMENT_WORKGROUP: u32 = 11;
const REFL_SPEC_CONSTANT_WORK_GROUP_SIZE: u32 = 12;
const REFL_PROPERTY_REQUIRED_WORK_GROUP_SIZE: u32 = 24;

const REFLECTION_SET_PREFIX: &str = "NonSemantic.ClspvReflection";

/// Argument kind, as declared by the IR producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Global-memory buffer bound as a storage buffer.
    Buffer,
    /// Constant-memory buffer bound as a uniform buffer.
    BufferUbo,
    /// Plain-old-data argument packed into a storage buffer.
    Pod,
    /// Plain-old-data argument packed into a uniform buffer.
    PodUbo,
    /// Plain-old-data argument passed as a push constant.
    PodPushConstant,
    /// Read-only image.
    SampledImage,
    /// Write-only image.
    StorageImage,
    Sampler,
    /// Local (workgroup) memory, sized through a spec constant.
    Local,
}

impl ArgKind {
    pub fn is_pod(self) -> bool {
        matches!(self, ArgKind::Pod | ArgKind::PodUbo | ArgKind::PodPushConstant)
    }
}

/// One kernel argument binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub kernel: String,
    pub ordinal: u32,
    pub kind: ArgKind,
    /// Descriptor binding index; doubles as the native argument slot.
    pub index: u32,
    /// Byte size: POD payload size, or the element size of a Local arg.
    pub size: u32,
    /// Byte offset of a POD argument within its packed block.
    pub offset: u32,
    /// Specialization-constant id sizing a Local argument.
    pub spec: u32,
}

/// Reflection extracted from one program binary.
#[derive(Debug, Default, Clone)]
pub struct Reflection {
    /// Kernel name → bindings sorted by ordinal.
    pub arguments: HashMap<String, Vec<Binding>>,
    /// Kernel name → reqd_work_group_size attribute, when declared.
    pub required_work_group_size: HashMap<String, Size>,
}

impl Reflection {
    pub fn kernel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.arguments.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

struct ExtInst {
    number: u32,
    result_id: u32,
    operands: Vec<u32>,
}

/// Scan a SPIR-V binary for reflection instructions.
pub fn reflect(binary: &[u32]) -> ClResult<Reflection> {
    if binary.len() < HEADER_WORDS || binary[0] != SPIRV_MAGIC {
        return Err(CL_INVALID_BINARY);
    }

    let mut strings: HashMap<u32, String> = HashMap::new();
    let mut constants: HashMap<u32, u32> = HashMap::new();
    let mut reflection_sets: Vec<u32> = Vec::new();
    let mut ext_insts: Vec<ExtInst> = Vec::new();

    let mut idx = HEADER_WORDS;
    while idx < binary.len() {
        let word = binary[idx];
        let word_count = (word >> 16) as usize;
        let opcode = word & 0xFFFF;

        if word_count == 0 || idx + word_count > binary.len() {
            return Err(CL_INVALID_BINARY);
        }
        let inst = &binary[idx..idx + word_count];

        match opcode {
            OP_STRING => {
                if inst.len() < 3 {
                    return Err(CL_INVALID_BINARY);
                }
                strings.insert(inst[1], decode_literal(&inst[2..])?);
            }
            OP_EXT_INST_IMPORT => {
                if inst.len() < 3 {
                    return Err(CL_INVALID_BINARY);
                }
                if decode_literal(&inst[2..])?.starts_with(REFLECTION_SET_PREFIX) {
                    reflection_sets.push(inst[1]);
                }
            }
            OP_CONSTANT => {
                if inst.len() < 4 {
                    return Err(CL_INVALID_BINARY);
                }
                // Only the low word matters; reflection operands are u32.
                constants.insert(inst[2], inst[3]);
            }
            OP_EXT_INST => {
                if inst.len() < 5 {
                    return Err(CL_INVALID_BINARY);
                }
                if reflection_sets.contains(&inst[3]) {
                    ext_insts.push(ExtInst {
                        number: inst[4],
                        result_id: inst[2],
                        operands: inst[5..].to_vec(),
                    });
                }
            }
            _ => {}
        }

        idx += word_count;
    }

    build_reflection(&strings, &constants, &ext_insts)
}

fn build_reflection(
    strings: &HashMap<u32, String>,
    constants: &HashMap<u32, u32>,
    ext_insts: &[ExtInst],
) -> ClResult<Reflection> {
    // Kernel declaration result-id → kernel name.
    let mut kernels: HashMap<u32, String> = HashMap::new();
    for inst in ext_insts.iter().filter(|i| i.number == REFL_KERNEL) {
        let name_id = *inst.operands.get(1).ok_or(CL_INVALID_BINARY)?;
        let name = strings.get(&name_id).ok_or(CL_INVALID_BINARY)?;
        kernels.insert(inst.result_id, name.clone());
    }

    let constant = |id: &u32| constants.get(id).copied().ok_or(CL_INVALID_BINARY);

    let mut reflection = Reflection::default();
    for name in kernels.values() {
        reflection.arguments.entry(name.clone()).or_default();
    }

    for inst in ext_insts {
        let kind = match inst.number {
            REFL_ARGUMENT_STORAGE_BUFFER => ArgKind::Buffer,
            REFL_ARGUMENT_UNIFORM => ArgKind::BufferUbo,
            REFL_ARGUMENT_POD_STORAGE_BUFFER => ArgKind::Pod,
            REFL_ARGUMENT_POD_UNIFORM => ArgKind::PodUbo,
            REFL_ARGUMENT_POD_PUSH_CONSTANT => ArgKind::PodPushConstant,
            REFL_ARGUMENT_SAMPLED_IMAGE => ArgKind::SampledImage,
            REFL_ARGUMENT_STORAGE_IMAGE => ArgKind::StorageImage,
            REFL_ARGUMENT_SAMPLER => ArgKind::Sampler,
            REFL_ARGUMENT_WORKGROUP => ArgKind::Local,
            REFL_PROPERTY_REQUIRED_WORK_GROUP_SIZE => {
                let ops = &inst.operands;
                if ops.len() < 4 {
                    return Err(CL_INVALID_BINARY);
                }
                let kernel = kernels.get(&ops[0]).ok_or(CL_INVALID_BINARY)?;
                let size = Size::new(
                    constant(&ops[1])? as usize,
                    constant(&ops[2])? as usize,
                    constant(&ops[3])? as usize,
                );
                reflection
                    .required_work_group_size
                    .insert(kernel.clone(), size);
                continue;
            }
            REFL_KERNEL
            | REFL_ARGUMENT_INFO
            | REFL_SPEC_CONSTANT_WORK_GROUP_SIZE => continue,
            _ => continue,
        };

        let ops = &inst.operands;
        let kernel = kernels
            .get(ops.first().ok_or(CL_INVALID_BINARY)?)
            .ok_or(CL_INVALID_BINARY)?;
        let ordinal = constant(ops.get(1).ok_or(CL_INVALID_BINARY)?)?;

        let binding = match kind {
            ArgKind::Buffer | ArgKind::BufferUbo | ArgKind::SampledImage
            | ArgKind::StorageImage | ArgKind::Sampler => {
                if ops.len() < 4 {
                    return Err(CL_INVALID_BINARY);
                }
                Binding {
                    kernel: kernel.clone(),
                    ordinal,
                    kind,
                    index: constant(&ops[3])?,
                    size: 0,
                    offset: 0,
                    spec: 0,
                }
            }
            ArgKind::Pod | ArgKind::PodUbo => {
                if ops.len() < 6 {
                    return Err(CL_INVALID_BINARY);
                }
                Binding {
                    kernel: kernel.clone(),
                    ordinal,
                    kind,
                    index: constant(&ops[3])?,
                    offset: constant(&ops[4])?,
                    size: constant(&ops[5])?,
                    spec: 0,
                }
            }
            ArgKind::PodPushConstant => {
                if ops.len() < 4 {
                    return Err(CL_INVALID_BINARY);
                }
                Binding {
                    kernel: kernel.clone(),
                    ordinal,
                    kind,
                    index: 0,
                    offset: constant(&ops[2])?,
                    size: constant(&ops[3])?,
                    spec: 0,
                }
            }
            ArgKind::Local => {
                if ops.len() < 4 {
                    return Err(CL_INVALID_BINARY);
                }
                Binding {
                    kernel: kernel.clone(),
                    ordinal,
                    kind,
                    index: 0,
                    spec: constant(&ops[2])?,
                    size: constant(&ops[3])?,
                    offset: 0,
                }
            }
        };

        reflection
            .arguments
            .get_mut(kernel)
            .ok_or(CL_INVALID_BINARY)?
            .push(binding);
    }

    for bindings in reflection.arguments.values_mut() {
        bindings.sort_by_key(|b| b.ordinal);
        // Every (kernel, ordinal) pair must be unique.
        if bindings.windows(2).any(|w| w[0].ordinal == w[1].ordinal) {
            return Err(CL_INVALID_BINARY);
        }
    }

    log::trace!(
        "reflected {} kernel(s): {:?}",
        reflection.arguments.len(),
        reflection.kernel_names()
    );

    Ok(reflection)
}

/// Decode a null-terminated UTF-8 literal from instruction words.
fn decode_literal(words: &[u32]) -> ClResult<String> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(CL_INVALID_BINARY)?;
    bytes.truncate(end);
    String::from_utf8(bytes).map_err(|_| CL_INVALID_BINARY)
}

#[cfg(test)]
pub(crate) mod test_binary {
    //! A minimal SPIR-V assembler for reflection fixtures.

    use super::*;

    pub struct ModuleBuilder {
        words: Vec<u32>,
        next_id: u32,
        set_id: u32,
        void_ty: u32,
        uint_ty: u32,
    }

    impl ModuleBuilder {
        pub fn new() -> ModuleBuilder {
            let mut b = ModuleBuilder {
                words: vec![SPIRV_MAGIC, 0x0001_0500, 0, 1000, 0],
                next_id: 1,
                set_id: 0,
                void_ty: 0,
                uint_ty: 0,
            };
            let set_id = b.id();
            b.set_id = set_id;
            b.emit_with_literal(OP_EXT_INST_IMPORT, &[set_id], "NonSemantic.ClspvReflection.5");
            b.void_ty = b.id();
            b.uint_ty = b.id();
            b
        }

        fn id(&mut self) -> u32 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        fn emit(&mut self, opcode: u32, operands: &[u32]) {
            let wc = (operands.len() + 1) as u32;
            self.words.push((wc << 16) | opcode);
            self.words.extend_from_slice(operands);
        }

        fn emit_with_literal(&mut self, opcode: u32, operands: &[u32], literal: &str) {
            let mut bytes = literal.as_bytes().to_vec();
            bytes.push(0);
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
            let literal_words: Vec<u32> = bytes
                .chunks(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let wc = (operands.len() + literal_words.len() + 1) as u32;
            self.words.push((wc << 16) | opcode);
            self.words.extend_from_slice(operands);
            self.words.extend_from_slice(&literal_words);
        }

        pub fn string(&mut self, s: &str) -> u32 {
            let id = self.id();
            self.emit_with_literal(OP_STRING, &[id], s);
            id
        }

        pub fn constant(&mut self, value: u32) -> u32 {
            let id = self.id();
            let ty = self.uint_ty;
            self.emit(OP_CONSTANT, &[ty, id, value]);
            id
        }

        pub fn reflection(&mut self, number: u32, operands: &[u32]) -> u32 {
            let id = self.id();
            let mut ops = vec![self.void_ty, id, self.set_id, number];
            ops.extend_from_slice(operands);
            self.emit(OP_EXT_INST, &ops);
            id
        }

        pub fn kernel(&mut self, name: &str) -> u32 {
            let name_id = self.string(name);
            let fn_id = self.id();
            self.reflection(REFL_KERNEL, &[fn_id, name_id])
        }

        pub fn storage_buffer_arg(&mut self, kernel: u32, ordinal: u32, binding: u32) {
            let ordinal = self.constant(ordinal);
            let set = self.constant(0);
            let binding = self.constant(binding);
            self.reflection(REFL_ARGUMENT_STORAGE_BUFFER, &[kernel, ordinal, set, binding]);
        }

        pub fn pod_ubo_arg(&mut self, kernel: u32, ordinal: u32, binding: u32, offset: u32, size: u32) {
            let ordinal = self.constant(ordinal);
            let set = self.constant(0);
            let binding = self.constant(binding);
            let offset = self.constant(offset);
            let size = self.constant(size);
            self.reflection(
                REFL_ARGUMENT_POD_UNIFORM,
                &[kernel, ordinal, set, binding, offset, size],
            );
        }

        pub fn workgroup_arg(&mut self, kernel: u32, ordinal: u32, spec: u32, elem_size: u32) {
            let ordinal = self.constant(ordinal);
            let spec = self.constant(spec);
            let elem_size = self.constant(elem_size);
            self.reflection(REFL_ARGUMENT_WORKGROUP, &[kernel, ordinal, spec, elem_size]);
        }

        pub fn required_work_group_size(&mut self, kernel: u32, w: u32, h: u32, d: u32) {
            let w = self.constant(w);
            let h = self.constant(h);
            let d = self.constant(d);
            self.reflection(REFL_PROPERTY_REQUIRED_WORK_GROUP_SIZE, &[kernel, w, h, d]);
        }

        pub fn build(self) -> Vec<u32> {
            self.words
        }
    }
}
