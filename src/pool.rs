use crate::class_file::{Attribute, AttributeLike, Serialize};
use crate::errors::Error;
use byteorder::WriteBytesExt;
use std::collections::HashMap;

/// Interning constant pool.
///
/// The pool is append only and 1-indexed. Structurally equal entries always
/// resolve to the same index; otherwise insertion order is preserved. `Long`
/// and `Double` entries occupy two slots, so the index issued for the entry
/// after them skips one.
pub struct ConstantPool {
    entries: Vec<Entry>,

    /// Index the next entry will receive (1-based, accounts for two-slot entries)
    next_index: u16,

    utf8s: HashMap<String, u16>,
    integers: HashMap<i32, u16>,
    floats: HashMap<u32, u16>,
    longs: HashMap<i64, u16>,
    doubles: HashMap<u64, u16>,
    classes: HashMap<u16, u16>,
    strings: HashMap<u16, u16>,
    name_and_types: HashMap<(u16, u16), u16>,
    field_refs: HashMap<(u16, u16), u16>,
    method_refs: HashMap<(u16, u16, bool), u16>,
    method_handles: HashMap<(HandleKind, u16), u16>,
    method_types: HashMap<u16, u16>,
    invoke_dynamics: HashMap<(u16, u16), u16>,

    bootstrap_methods: Vec<BootstrapMethod>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: Vec::new(),
            next_index: 1,
            utf8s: HashMap::new(),
            integers: HashMap::new(),
            floats: HashMap::new(),
            longs: HashMap::new(),
            doubles: HashMap::new(),
            classes: HashMap::new(),
            strings: HashMap::new(),
            name_and_types: HashMap::new(),
            field_refs: HashMap::new(),
            method_refs: HashMap::new(),
            method_handles: HashMap::new(),
            method_types: HashMap::new(),
            invoke_dynamics: HashMap::new(),
            bootstrap_methods: Vec::new(),
        }
    }

    /// Number of entries (not slots) in the pool
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, provided there is still room for it.
    ///
    /// The largest addressable index is 65535 and `Long`/`Double` consume two
    /// slots, so the check is on the slot the entry would end at.
    fn push_entry(&mut self, entry: Entry) -> Result<u16, Error> {
        let index = self.next_index;
        match index.checked_add(entry.slot_width()) {
            Some(next) => {
                self.next_index = next;
                self.entries.push(entry);
                Ok(index)
            }
            None => Err(Error::PoolOverflow { entry }),
        }
    }

    /// Get or insert a `CONSTANT_Utf8_info`
    pub fn utf8(&mut self, text: &str) -> Result<u16, Error> {
        if let Some(idx) = self.utf8s.get(text) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::Utf8(text.to_owned()))?;
        self.utf8s.insert(text.to_owned(), idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Integer_info`
    pub fn integer(&mut self, value: i32) -> Result<u16, Error> {
        if let Some(idx) = self.integers.get(&value) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::Integer(value))?;
        self.integers.insert(value, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Float_info` (interned by bit pattern)
    pub fn float(&mut self, value: f32) -> Result<u16, Error> {
        let bits = value.to_bits();
        if let Some(idx) = self.floats.get(&bits) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::Float(value))?;
        self.floats.insert(bits, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Long_info` (occupies two slots)
    pub fn long(&mut self, value: i64) -> Result<u16, Error> {
        if let Some(idx) = self.longs.get(&value) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::Long(value))?;
        self.longs.insert(value, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Double_info` (occupies two slots)
    pub fn double(&mut self, value: f64) -> Result<u16, Error> {
        let bits = value.to_bits();
        if let Some(idx) = self.doubles.get(&bits) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::Double(value))?;
        self.doubles.insert(bits, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Class_info` for a binary name (or, for array
    /// classes, the full array descriptor)
    pub fn class(&mut self, binary_name: &str) -> Result<u16, Error> {
        let name = self.utf8(binary_name)?;
        if let Some(idx) = self.classes.get(&name) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::Class { name })?;
        self.classes.insert(name, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_String_info`
    pub fn string(&mut self, text: &str) -> Result<u16, Error> {
        let utf8 = self.utf8(text)?;
        if let Some(idx) = self.strings.get(&utf8) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::String { utf8 })?;
        self.strings.insert(utf8, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_NameAndType_info`
    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, Error> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        if let Some(idx) = self.name_and_types.get(&(name, descriptor)) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::NameAndType { name, descriptor })?;
        self.name_and_types.insert((name, descriptor), idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Fieldref_info`
    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, Error> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        if let Some(idx) = self.field_refs.get(&(class, name_and_type)) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::FieldRef {
            class,
            name_and_type,
        })?;
        self.field_refs.insert((class, name_and_type), idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_Methodref_info` or, when `is_interface`, a
    /// `CONSTANT_InterfaceMethodref_info`
    pub fn method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<u16, Error> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        if let Some(idx) = self.method_refs.get(&(class, name_and_type, is_interface)) {
            return Ok(*idx);
        }
        let entry = if is_interface {
            Entry::InterfaceMethodRef {
                class,
                name_and_type,
            }
        } else {
            Entry::MethodRef {
                class,
                name_and_type,
            }
        };
        let idx = self.push_entry(entry)?;
        self.method_refs
            .insert((class, name_and_type, is_interface), idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_MethodHandle_info`
    pub fn method_handle(&mut self, kind: HandleKind, member: u16) -> Result<u16, Error> {
        if let Some(idx) = self.method_handles.get(&(kind, member)) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::MethodHandle { kind, member })?;
        self.method_handles.insert((kind, member), idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_MethodType_info`
    pub fn method_type(&mut self, descriptor: &str) -> Result<u16, Error> {
        let descriptor = self.utf8(descriptor)?;
        if let Some(idx) = self.method_types.get(&descriptor) {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::MethodType { descriptor })?;
        self.method_types.insert(descriptor, idx);
        Ok(idx)
    }

    /// Get or insert a `CONSTANT_InvokeDynamic_info`
    pub fn invoke_dynamic(
        &mut self,
        bootstrap_method: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, Error> {
        if bootstrap_method as usize >= self.bootstrap_methods.len() {
            return Err(Error::UnsupportedConstruct(
                "invokedynamic without a registered bootstrap method",
            ));
        }
        let name_and_type = self.name_and_type(name, descriptor)?;
        if let Some(idx) = self
            .invoke_dynamics
            .get(&(bootstrap_method, name_and_type))
        {
            return Ok(*idx);
        }
        let idx = self.push_entry(Entry::InvokeDynamic {
            bootstrap_method,
            name_and_type,
        })?;
        self.invoke_dynamics
            .insert((bootstrap_method, name_and_type), idx);
        Ok(idx)
    }

    /// Register a bootstrap method and return its index into the
    /// `BootstrapMethods` attribute (not a constant pool index).
    ///
    /// Equal (handle, arguments) pairs dedupe to the same index.
    pub fn add_bootstrap_method(
        &mut self,
        method_handle: u16,
        arguments: Vec<u16>,
    ) -> Result<u16, Error> {
        for (idx, bsm) in self.bootstrap_methods.iter().enumerate() {
            if bsm.method_handle == method_handle && bsm.arguments == arguments {
                return Ok(idx as u16);
            }
        }
        let idx = self.bootstrap_methods.len() as u16;
        self.bootstrap_methods.push(BootstrapMethod {
            method_handle,
            arguments,
        });
        Ok(idx)
    }

    /// Build an attribute: intern its name and serialize its payload
    pub fn attribute<A: AttributeLike>(&mut self, attribute: A) -> Result<Attribute, Error> {
        let name_index = self.utf8(A::NAME)?;
        let mut info = Vec::new();
        attribute.serialize(&mut info)?;
        Ok(Attribute { name_index, info })
    }

    /// Build the `BootstrapMethods` attribute, if any bootstrap methods were
    /// registered. Must be called before the pool is frozen into a class.
    pub fn bootstrap_attribute(&mut self) -> Result<Option<Attribute>, Error> {
        if self.bootstrap_methods.is_empty() {
            return Ok(None);
        }
        let table = BootstrapMethods(std::mem::take(&mut self.bootstrap_methods));
        let attribute = self.attribute(table)?;
        Ok(Some(attribute))
    }
}

impl Default for ConstantPool {
    fn default() -> ConstantPool {
        ConstantPool::new()
    }
}

impl Serialize for ConstantPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        // constant_pool_count is one more than the number of slots
        self.next_index.serialize(writer)?;
        for entry in &self.entries {
            entry.serialize(writer)?;
        }
        Ok(())
    }
}

/// A single constant pool entry
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name: u16 },
    String { utf8: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: HandleKind, member: u16 },
    MethodType { descriptor: u16 },
    InvokeDynamic { bootstrap_method: u16, name_and_type: u16 },
}

impl Entry {
    /// Slots the entry takes up. Quoting the JVM specification:
    ///
    /// > All 8-byte constants take up two entries in the constant_pool table
    /// > of the class file. [...] In retrospect, making 8-byte constants take
    /// > two constant pool entries was a poor choice.
    pub fn slot_width(&self) -> u16 {
        match self {
            Entry::Long(_) | Entry::Double(_) => 2,
            _ => 1,
        }
    }
}

impl Serialize for Entry {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Entry::Utf8(text) => {
                1u8.serialize(writer)?;
                let encoded = encode_modified_utf8(text);
                (encoded.len() as u16).serialize(writer)?;
                writer.write_all(&encoded)?;
            }
            Entry::Integer(value) => {
                3u8.serialize(writer)?;
                value.serialize(writer)?;
            }
            Entry::Float(value) => {
                4u8.serialize(writer)?;
                value.serialize(writer)?;
            }
            Entry::Long(value) => {
                5u8.serialize(writer)?;
                value.serialize(writer)?;
            }
            Entry::Double(value) => {
                6u8.serialize(writer)?;
                value.serialize(writer)?;
            }
            Entry::Class { name } => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Entry::String { utf8 } => {
                8u8.serialize(writer)?;
                utf8.serialize(writer)?;
            }
            Entry::FieldRef {
                class,
                name_and_type,
            } => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Entry::MethodRef {
                class,
                name_and_type,
            } => {
                10u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Entry::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                11u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Entry::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Entry::MethodHandle { kind, member } => {
                15u8.serialize(writer)?;
                kind.byte().serialize(writer)?;
                member.serialize(writer)?;
            }
            Entry::MethodType { descriptor } => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Entry::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
        }
        Ok(())
    }
}

/// Kind of method handle
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-5.html#jvms-5.4.3.5
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub fn byte(&self) -> u8 {
        match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        }
    }
}

/// One row of the `BootstrapMethods` attribute
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapMethod {
    pub method_handle: u16,
    pub arguments: Vec<u16>,
}

impl Serialize for BootstrapMethod {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.method_handle.serialize(writer)?;
        self.arguments.serialize(writer)?;
        Ok(())
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.23
#[derive(Debug)]
pub struct BootstrapMethods(pub Vec<BootstrapMethod>);

impl AttributeLike for BootstrapMethods {
    const NAME: &'static str = "BootstrapMethods";
}

impl Serialize for BootstrapMethods {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

/// Modified UTF-8 as used by class files.
///
/// Differences from real UTF-8: NUL is encoded in two bytes so encoded
/// strings never embed a zero byte, only the 1/2/3-byte forms are used, and
/// supplementary characters become surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        match code {
            0x0001..=0x007f => out.push(code as u8),
            // NUL takes the two-byte form
            0x0000 | 0x0080..=0x07ff => {
                out.push(0b1100_0000 | (code >> 6 & 0x1f) as u8);
                out.push(0b1000_0000 | (code & 0x3f) as u8);
            }
            0x0800..=0xffff => {
                out.push(0b1110_0000 | (code >> 12 & 0x0f) as u8);
                out.push(0b1000_0000 | (code >> 6 & 0x3f) as u8);
                out.push(0b1000_0000 | (code & 0x3f) as u8);
            }
            // surrogate pair over the supplementary value
            _ => {
                let above = code - 0x1_0000;
                let high = 0xd800 + (above >> 10);
                let low = 0xdc00 + (above & 0x3ff);
                for half in [high, low] {
                    out.push(0b1110_0000 | (half >> 12 & 0x0f) as u8);
                    out.push(0b1000_0000 | (half >> 6 & 0x3f) as u8);
                    out.push(0b1000_0000 | (half & 0x3f) as u8);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_stable_indices() {
        let mut pool = ConstantPool::new();
        assert_eq!(pool.utf8("a").unwrap(), 1);
        assert_eq!(pool.utf8("a").unwrap(), 1);
        assert_eq!(pool.utf8("b").unwrap(), 2);
    }

    #[test]
    fn eight_byte_constants_take_two_slots() {
        let mut pool = ConstantPool::new();
        assert_eq!(pool.long(7).unwrap(), 1);
        assert_eq!(pool.utf8("after long").unwrap(), 3);
        assert_eq!(pool.double(1.5).unwrap(), 4);
        assert_eq!(pool.utf8("after double").unwrap(), 6);
        // interned lookups still hit the original index
        assert_eq!(pool.long(7).unwrap(), 1);
        assert_eq!(pool.double(1.5).unwrap(), 4);
    }

    #[test]
    fn refs_share_substructure() {
        let mut pool = ConstantPool::new();
        let f1 = pool
            .field_ref("java/lang/System", "out", "Ljava/io/PrintStream;")
            .unwrap();
        let f2 = pool
            .field_ref("java/lang/System", "err", "Ljava/io/PrintStream;")
            .unwrap();
        assert_ne!(f1, f2);
        // class and descriptor utf8 are shared, so only name + nat + ref are new
        assert_eq!(pool.len(), 9);
    }

    #[test]
    fn pool_overflow_is_fatal() {
        let mut pool = ConstantPool::new();
        pool.next_index = u16::MAX;
        match pool.long(42) {
            Err(Error::PoolOverflow { .. }) => (),
            other => panic!("expected overflow, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bootstrap_methods_dedupe() {
        let mut pool = ConstantPool::new();
        assert_eq!(pool.add_bootstrap_method(5, vec![7]).unwrap(), 0);
        assert_eq!(pool.add_bootstrap_method(5, vec![7]).unwrap(), 0);
        assert_eq!(pool.add_bootstrap_method(5, vec![8]).unwrap(), 1);
    }

    #[test]
    fn invoke_dynamic_requires_bootstrap_method() {
        let mut pool = ConstantPool::new();
        match pool.invoke_dynamic(0, "apply", "()Ljava/lang/Object;") {
            Err(Error::UnsupportedConstruct(_)) => (),
            other => panic!("expected unsupported construct, got {:?}", other),
        }
    }

    #[test]
    fn modified_utf8_ascii() {
        assert_eq!(encode_modified_utf8("foo"), vec![102, 111, 111]);
    }

    #[test]
    fn modified_utf8_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
    }

    #[test]
    fn modified_utf8_supplementary() {
        // U+10400 -> surrogates D801 DC00, each in the 3-byte form
        assert_eq!(
            encode_modified_utf8("\u{10400}"),
            vec![0xed, 0xa0, 0x81, 0xed, 0xb0, 0x80]
        );
    }
}
