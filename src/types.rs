//! DSDL type system: primitive, array, void and compound types with their bit-length arithmetic.
//!
//! Compound types live in a [`TypeTable`] arena and are referenced by [`TypeId`], so every
//! length computation that can reach a compound type takes the table as a parameter.

use std::collections::HashMap;
use std::fmt;
use std::ops::Index;

/// Wire-level base kind of a scalar value. `Void` only appears on flattened padding channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Boolean,
    UnsignedInt,
    SignedInt,
    Float,
    Void,
}

impl BaseType {
    pub fn name(&self) -> &'static str {
        match self {
            BaseType::Boolean => "bool",
            BaseType::UnsignedInt => "uint",
            BaseType::SignedInt => "int",
            BaseType::Float => "float",
            BaseType::Void => "void",
        }
    }
}

/// Out-of-range policy on encode. Recorded from the schema; not applied by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CastMode {
    #[default]
    Saturated,
    Truncated,
}

impl CastMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CastMode::Saturated => "saturated",
            CastMode::Truncated => "truncated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Primitive,
    Array,
    Compound,
    Void,
}

/// `bool`, `intN`, `uintN` or `floatN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveType {
    base: BaseType,
    bit_length: u32,
    cast_mode: CastMode,
}

impl PrimitiveType {
    /// Validates the width for the base kind: bool is 1 bit, integers 2..=64, floats 16/32/64.
    pub fn new(base: BaseType, bit_length: u32, cast_mode: CastMode) -> Result<Self, String> {
        let ok = match base {
            BaseType::Boolean => bit_length == 1,
            BaseType::UnsignedInt | BaseType::SignedInt => (2..=64).contains(&bit_length),
            BaseType::Float => matches!(bit_length, 16 | 32 | 64),
            BaseType::Void => false,
        };
        if !ok {
            return Err(match base {
                BaseType::Boolean => "bool is always 1 bit".to_string(),
                BaseType::UnsignedInt | BaseType::SignedInt => format!(
                    "{}{}: integer bit length must be in [2, 64]",
                    base.name(),
                    bit_length
                ),
                BaseType::Float => format!("float{}: bit length must be 16, 32 or 64", bit_length),
                BaseType::Void => "void is not a primitive type".to_string(),
            });
        }
        Ok(PrimitiveType { base, bit_length, cast_mode })
    }

    pub fn boolean(cast_mode: CastMode) -> Self {
        PrimitiveType { base: BaseType::Boolean, bit_length: 1, cast_mode }
    }

    pub fn base_type(&self) -> BaseType {
        self.base
    }

    pub fn bit_length(&self) -> u32 {
        self.bit_length
    }

    pub fn cast_mode(&self) -> CastMode {
        self.cast_mode
    }

    /// Representable `(min, max)` of the type.
    pub fn value_range(&self) -> (f64, f64) {
        match self.base {
            BaseType::Boolean => (0.0, 1.0),
            BaseType::UnsignedInt => (0.0, unsigned_max(self.bit_length) as f64),
            BaseType::SignedInt => {
                let half = 1i128 << (self.bit_length - 1);
                (-(half as f64), (half - 1) as f64)
            }
            BaseType::Float => {
                let max = match self.bit_length {
                    16 => 65504.0,
                    32 => f32::MAX as f64,
                    _ => f64::MAX,
                };
                (-max, max)
            }
            BaseType::Void => (0.0, 0.0),
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            BaseType::Boolean => write!(f, "{} bool", self.cast_mode.as_str()),
            _ => write!(f, "{} {}{}", self.cast_mode.as_str(), self.base.name(), self.bit_length),
        }
    }
}

/// Padding of 1..=64 bits. Carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoidType {
    bit_length: u32,
}

impl VoidType {
    pub fn new(bit_length: u32) -> Result<Self, String> {
        if !(1..=64).contains(&bit_length) {
            return Err(format!("void{}: bit length must be in [1, 64]", bit_length));
        }
        Ok(VoidType { bit_length })
    }

    pub fn bit_length(&self) -> u32 {
        self.bit_length
    }
}

impl fmt::Display for VoidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "void{}", self.bit_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMode {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    element: Box<DsdlType>,
    mode: ArrayMode,
    max_size: u32,
}

impl ArrayType {
    pub fn new(element: DsdlType, mode: ArrayMode, max_size: u32) -> Self {
        ArrayType { element: Box::new(element), mode, max_size }
    }

    pub fn element(&self) -> &DsdlType {
        &self.element
    }

    pub fn mode(&self) -> ArrayMode {
        self.mode
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn is_dynamic(&self) -> bool {
        self.mode == ArrayMode::Dynamic
    }

    /// Width of the element-count prefix of a dynamic array; zero for static arrays.
    pub fn size_prefix_bits(&self) -> u32 {
        match self.mode {
            ArrayMode::Static => 0,
            ArrayMode::Dynamic => ceil_log2(self.max_size),
        }
    }

    /// Saturates at `u32::MAX`; see [`ArrayType::checked_max_bit_length`].
    pub fn max_bit_length(&self, table: &TypeTable) -> u32 {
        self.checked_max_bit_length(table).unwrap_or(u32::MAX)
    }

    /// `None` when the length does not fit in 32 bits.
    pub fn checked_max_bit_length(&self, table: &TypeTable) -> Option<u32> {
        self.max_size
            .checked_mul(self.element.checked_max_bit_length(table)?)?
            .checked_add(self.size_prefix_bits())
    }

    pub fn min_bit_length(&self, table: &TypeTable) -> u32 {
        match self.mode {
            ArrayMode::Static => self.max_size.saturating_mul(self.element.min_bit_length(table)),
            ArrayMode::Dynamic => 0,
        }
    }
}

/// Index of a [`CompoundType`] inside a [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

impl TypeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Any type a DSDL attribute can have.
#[derive(Debug, Clone, PartialEq)]
pub enum DsdlType {
    Primitive(PrimitiveType),
    Array(ArrayType),
    Compound(TypeId),
    Void(VoidType),
}

impl DsdlType {
    pub fn category(&self) -> Category {
        match self {
            DsdlType::Primitive(_) => Category::Primitive,
            DsdlType::Array(_) => Category::Array,
            DsdlType::Compound(_) => Category::Compound,
            DsdlType::Void(_) => Category::Void,
        }
    }

    pub fn max_bit_length(&self, table: &TypeTable) -> u32 {
        self.checked_max_bit_length(table).unwrap_or(u32::MAX)
    }

    pub fn checked_max_bit_length(&self, table: &TypeTable) -> Option<u32> {
        match self {
            DsdlType::Primitive(p) => Some(p.bit_length()),
            DsdlType::Void(v) => Some(v.bit_length()),
            DsdlType::Array(a) => a.checked_max_bit_length(table),
            DsdlType::Compound(id) => compute_max_len(&table[*id].request_fields, table[*id].request_union, table),
        }
    }

    pub fn min_bit_length(&self, table: &TypeTable) -> u32 {
        match self {
            DsdlType::Primitive(p) => p.bit_length(),
            DsdlType::Void(v) => v.bit_length(),
            DsdlType::Array(a) => a.min_bit_length(table),
            DsdlType::Compound(id) => table[*id].min_bit_length_request(table),
        }
    }

    /// Normalized textual definition, e.g. `saturated float32`, `truncated uint8[<=16]`, `void3`.
    pub fn definition(&self, table: &TypeTable) -> String {
        match self {
            DsdlType::Primitive(p) => p.to_string(),
            DsdlType::Void(v) => v.to_string(),
            DsdlType::Compound(id) => table[*id].full_name().to_string(),
            DsdlType::Array(a) => {
                let element = a.element().definition(table);
                match a.mode() {
                    ArrayMode::Static => format!("{}[{}]", element, a.max_size()),
                    ArrayMode::Dynamic => format!("{}[<={}]", element, a.max_size()),
                }
            }
        }
    }
}

/// A data field. An empty name marks anonymous void padding.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: DsdlType,
}

impl Field {
    pub fn new(ty: DsdlType, name: impl Into<String>) -> Self {
        Field { name: name.into(), ty }
    }

    pub fn padding(void: VoidType) -> Self {
        Field { name: String::new(), ty: DsdlType::Void(void) }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.ty, DsdlType::Void(_))
    }

    pub fn definition(&self, table: &TypeTable) -> String {
        if self.is_void() {
            self.ty.definition(table)
        } else {
            format!("{} {}", self.ty.definition(table), self.name)
        }
    }
}

/// Literal value of a constant, typed by the constant's primitive base kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
    Bool(bool),
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f64),
}

impl ConstantValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ConstantValue::Bool(b) => f64::from(u8::from(*b)),
            ConstantValue::SignedInt(v) => *v as f64,
            ConstantValue::UnsignedInt(v) => *v as f64,
            ConstantValue::Float(v) => *v,
        }
    }

    /// Integer value as a u64, if the constant is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConstantValue::SignedInt(v) => (*v).try_into().ok(),
            ConstantValue::UnsignedInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Bool(b) => write!(f, "{}", b),
            ConstantValue::SignedInt(v) => write!(f, "{}", v),
            ConstantValue::UnsignedInt(v) => write!(f, "{}", v),
            ConstantValue::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub name: String,
    pub ty: PrimitiveType,
    pub value: ConstantValue,
    /// Initializer as written, whitespace removed.
    pub expression: String,
}

impl Constant {
    /// Canonical string form of the value.
    pub fn string_value(&self) -> String {
        self.value.to_string()
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} = {}", self.ty, self.name, self.expression)
    }
}

/// One parsed attribute line.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Field(Field),
    Constant(Constant),
}

impl Attribute {
    pub fn name(&self) -> &str {
        match self {
            Attribute::Field(f) => &f.name,
            Attribute::Constant(c) => &c.name,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Attribute::Constant(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Message,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A message or service definition (one `.uavcan` file).
///
/// `subject_id == 0` marks a nested structure that is never routed on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundType {
    full_name: String,
    pub version: Version,
    pub subject_id: u32,
    pub kind: MessageKind,
    pub request_fields: Vec<Field>,
    pub response_fields: Vec<Field>,
    pub request_constants: Vec<Constant>,
    pub response_constants: Vec<Constant>,
    pub request_union: bool,
    pub response_union: bool,
}

impl CompoundType {
    pub fn new(full_name: impl Into<String>, kind: MessageKind, subject_id: u32, version: Version) -> Self {
        CompoundType {
            full_name: full_name.into(),
            version,
            subject_id,
            kind,
            request_fields: Vec::new(),
            response_fields: Vec::new(),
            request_constants: Vec::new(),
            response_constants: Vec::new(),
            request_union: false,
            response_union: false,
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Last dotted segment of the full name.
    pub fn short_name(&self) -> &str {
        self.full_name.rsplit('.').next().unwrap_or(&self.full_name)
    }

    pub fn namespace(&self) -> &str {
        match self.full_name.rfind('.') {
            Some(i) => &self.full_name[..i],
            None => "",
        }
    }

    pub fn is_service(&self) -> bool {
        self.kind == MessageKind::Service
    }

    pub fn is_routable(&self) -> bool {
        self.subject_id != 0
    }

    pub fn max_bit_length_request(&self, table: &TypeTable) -> u32 {
        compute_max_len(&self.request_fields, self.request_union, table).unwrap_or(u32::MAX)
    }

    pub fn max_bit_length_response(&self, table: &TypeTable) -> u32 {
        compute_max_len(&self.response_fields, self.response_union, table).unwrap_or(u32::MAX)
    }

    pub fn min_bit_length_request(&self, table: &TypeTable) -> u32 {
        compute_min_len(&self.request_fields, self.request_union, table)
    }

    pub fn min_bit_length_response(&self, table: &TypeTable) -> u32 {
        compute_min_len(&self.response_fields, self.response_union, table)
    }
}

fn union_tag_bits(field_count: usize) -> u32 {
    bit_width(field_count.saturating_sub(1).max(1) as u32)
}

/// `None` on `u32` overflow.
fn compute_max_len(fields: &[Field], union: bool, table: &TypeTable) -> Option<u32> {
    if fields.is_empty() {
        return Some(0);
    }
    let mut total = 0u32;
    for field in fields {
        let len = field.ty.checked_max_bit_length(table)?;
        total = if union { total.max(len) } else { total.checked_add(len)? };
    }
    if union {
        total.checked_add(union_tag_bits(fields.len()))
    } else {
        Some(total)
    }
}

fn compute_min_len(fields: &[Field], union: bool, table: &TypeTable) -> u32 {
    if fields.is_empty() {
        return 0;
    }
    let lengths = fields.iter().map(|f| f.ty.min_bit_length(table));
    if union {
        lengths.min().unwrap_or(0).saturating_add(union_tag_bits(fields.len()))
    } else {
        lengths.fold(0u32, u32::saturating_add)
    }
}

/// Arena of compound types, unique by full name.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: Vec<CompoundType>,
    by_name: HashMap<String, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type. Fails if the full name is already taken.
    pub fn insert(&mut self, ty: CompoundType) -> Result<TypeId, String> {
        if self.by_name.contains_key(ty.full_name()) {
            return Err(format!("Duplicate type name: {}", ty.full_name()));
        }
        let id = TypeId(self.types.len());
        self.by_name.insert(ty.full_name().to_string(), id);
        self.types.push(ty);
        Ok(id)
    }

    pub fn lookup(&self, full_name: &str) -> Option<TypeId> {
        self.by_name.get(full_name).copied()
    }

    pub fn get_by_name(&self, full_name: &str) -> Option<&CompoundType> {
        self.lookup(full_name).map(|id| &self.types[id.0])
    }

    pub fn get(&self, id: TypeId) -> Option<&CompoundType> {
        self.types.get(id.0)
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.by_name.contains_key(full_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &CompoundType)> {
        self.types.iter().enumerate().map(|(i, t)| (TypeId(i), t))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Index<TypeId> for TypeTable {
    type Output = CompoundType;

    fn index(&self, id: TypeId) -> &CompoundType {
        &self.types[id.0]
    }
}

/// `ceil(log2(n))`, zero for `n <= 1`.
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// Number of binary digits needed to write `n` (at least 1).
pub fn bit_width(n: u32) -> u32 {
    (32 - n.leading_zeros()).max(1)
}

pub(crate) fn unsigned_max(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
