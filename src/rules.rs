//! Serialization rules: every routable compound type flattened into an ordered list of
//! leaf wire fields ("channels"), indexed by subject id and by full name.

use crate::parser::{DsdlError, DsdlParser};
use crate::types::*;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{info, warn};

/// One flattened leaf field.
#[derive(Debug, Clone, PartialEq)]
pub struct UavcanChannel {
    pub base_type: BaseType,
    /// Bit width of one value (one element for dynamic arrays).
    pub size: u32,
    /// Dotted path; empty for padding.
    pub field_name: String,
    pub is_array: bool,
    pub array_size: u32,
    pub is_dynamic: bool,
    pub size_prefix_bits: u32,
}

impl UavcanChannel {
    pub fn scalar(base_type: BaseType, size: u32, field_name: impl Into<String>) -> Self {
        UavcanChannel {
            base_type,
            size,
            field_name: field_name.into(),
            is_array: false,
            array_size: 0,
            is_dynamic: false,
            size_prefix_bits: 0,
        }
    }

    pub fn padding(size: u32) -> Self {
        Self::scalar(BaseType::Void, size, "")
    }

    /// Dynamic primitive array: a `ceil(log2(max))`-bit count followed by up to `max` elements.
    pub fn dynamic_array(base_type: BaseType, size: u32, field_name: impl Into<String>, max: u32) -> Self {
        UavcanChannel {
            is_array: true,
            array_size: max,
            is_dynamic: true,
            size_prefix_bits: ceil_log2(max),
            ..Self::scalar(base_type, size, field_name)
        }
    }

    pub fn is_void(&self) -> bool {
        self.base_type == BaseType::Void
    }

    /// Bits this channel occupies at most on the wire.
    pub fn max_bit_length(&self) -> u32 {
        if self.is_dynamic {
            self.size.saturating_mul(self.array_size).saturating_add(self.size_prefix_bits)
        } else {
            self.size
        }
    }

    /// Largest element count a dynamic array can carry: its declared max, further limited by
    /// what the count prefix can hold (`uint8[<=8]` has a 3-bit prefix and carries at most 7).
    pub fn max_count(&self) -> u32 {
        let prefix_max = unsigned_max(self.size_prefix_bits).min(u64::from(u32::MAX)) as u32;
        self.array_size.min(prefix_max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UavcanService {
    pub request: Vec<UavcanChannel>,
    pub response: Vec<UavcanChannel>,
    pub subject_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRule {
    pub subject_id: u32,
    pub name: String,
    pub channels: Vec<UavcanChannel>,
}

/// Channel tables for all routable messages and services. Read-only once generated.
#[derive(Debug, Clone, Default)]
pub struct SerializationRules {
    messages: BTreeMap<u32, MessageRule>,
    services: BTreeMap<u32, UavcanService>,
    message_ids: HashMap<String, u32>,
    service_ids: HashMap<String, u32>,
}

impl SerializationRules {
    /// Flatten every type with a non-zero subject id.
    pub fn generate(table: &TypeTable) -> Result<Self, DsdlError> {
        let mut rules = SerializationRules::default();
        for (_, ty) in table.iter().filter(|(_, t)| t.is_routable()) {
            let name = ty.full_name().to_string();
            let id = ty.subject_id;
            match ty.kind {
                MessageKind::Message => {
                    if let Some(first) = rules.messages.get(&id) {
                        return Err(DsdlError::DuplicateSubjectId {
                            kind: "message",
                            subject_id: id,
                            first: first.name.clone(),
                            second: name,
                        });
                    }
                    let channels = flatten(&ty.request_fields, &name, table);
                    rules.message_ids.insert(name.clone(), id);
                    rules.messages.insert(id, MessageRule { subject_id: id, name, channels });
                }
                MessageKind::Service => {
                    if let Some(first) = rules.services.get(&id) {
                        return Err(DsdlError::DuplicateSubjectId {
                            kind: "service",
                            subject_id: id,
                            first: first.name.clone(),
                            second: name,
                        });
                    }
                    let service = UavcanService {
                        request: flatten(&ty.request_fields, &name, table),
                        response: flatten(&ty.response_fields, &name, table),
                        subject_id: id,
                        name: name.clone(),
                    };
                    rules.service_ids.insert(name, id);
                    rules.services.insert(id, service);
                }
            }
        }
        info!(
            messages = rules.messages.len(),
            services = rules.services.len(),
            "generated serialization rules"
        );
        Ok(rules)
    }

    /// Parse everything under `root` and generate rules. Nothing is returned unless both steps succeed.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, DsdlError> {
        let mut parser = DsdlParser::new(root);
        let table = parser.parse_all_directories()?;
        Self::generate(table)
    }

    pub fn try_get_message_by_id(&self, subject_id: u32) -> Option<&[UavcanChannel]> {
        self.messages.get(&subject_id).map(|m| m.channels.as_slice())
    }

    pub fn try_get_message_by_name(&self, name: &str) -> Option<&[UavcanChannel]> {
        self.message_id(name).and_then(|id| self.try_get_message_by_id(id))
    }

    pub fn try_get_service_by_id(&self, subject_id: u32) -> Option<&UavcanService> {
        self.services.get(&subject_id)
    }

    pub fn try_get_service_by_name(&self, name: &str) -> Option<&UavcanService> {
        self.service_id(name).and_then(|id| self.services.get(&id))
    }

    pub fn message_name(&self, subject_id: u32) -> Option<&str> {
        self.messages.get(&subject_id).map(|m| m.name.as_str())
    }

    pub fn service_name(&self, subject_id: u32) -> Option<&str> {
        self.services.get(&subject_id).map(|s| s.name.as_str())
    }

    pub fn message_id(&self, name: &str) -> Option<u32> {
        self.message_ids.get(name).copied()
    }

    pub fn service_id(&self, name: &str) -> Option<u32> {
        self.service_ids.get(name).copied()
    }

    /// Message rules in subject-id order.
    pub fn messages(&self) -> impl Iterator<Item = &MessageRule> {
        self.messages.values()
    }

    /// Service rules in subject-id order.
    pub fn services(&self) -> impl Iterator<Item = &UavcanService> {
        self.services.values()
    }

    /// Byte length of the largest message or service section, rounded up.
    pub fn max_payload_bytes(&self) -> usize {
        let bytes = |channels: &[UavcanChannel]| {
            let bits: u64 = channels.iter().map(|c| u64::from(c.max_bit_length())).sum();
            bits.div_ceil(8) as usize
        };
        let messages = self.messages.values().map(|m| bytes(&m.channels));
        let services = self.services.values().flat_map(|s| [bytes(&s.request), bytes(&s.response)]);
        messages.chain(services).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.services.is_empty()
    }
}

fn join_path(parent: &str, name: &str) -> String {
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{}.{}", parent, name),
    }
}

/// Flatten `fields` into channels whose names are prefixed with `parent`.
///
/// Unions are flattened member by member, without a tag channel.
pub fn flatten(fields: &[Field], parent: &str, table: &TypeTable) -> Vec<UavcanChannel> {
    let mut out = Vec::new();
    for field in fields {
        flatten_field(&field.ty, &field.name, parent, table, &mut out);
    }
    out
}

fn flatten_field(ty: &DsdlType, name: &str, parent: &str, table: &TypeTable, out: &mut Vec<UavcanChannel>) {
    match ty {
        DsdlType::Void(v) => out.push(UavcanChannel::padding(v.bit_length())),
        DsdlType::Primitive(p) => out.push(UavcanChannel::scalar(p.base_type(), p.bit_length(), join_path(parent, name))),
        DsdlType::Compound(id) => {
            out.extend(flatten(&table[*id].request_fields, &join_path(parent, name), table));
        }
        DsdlType::Array(array) => {
            let path = join_path(parent, name);
            match (array.element(), array.mode()) {
                (DsdlType::Primitive(p), ArrayMode::Dynamic) => out.push(UavcanChannel::dynamic_array(
                    p.base_type(),
                    p.bit_length(),
                    path,
                    array.max_size(),
                )),
                (DsdlType::Primitive(p), ArrayMode::Static) => {
                    for i in 0..array.max_size() {
                        out.push(UavcanChannel::scalar(p.base_type(), p.bit_length(), format!("{}_{}", path, i)));
                    }
                }
                (DsdlType::Compound(id), mode) => {
                    let template = flatten(&table[*id].request_fields, "", table);
                    if mode == ArrayMode::Dynamic && array.size_prefix_bits() > 0 {
                        out.push(UavcanChannel::scalar(
                            BaseType::UnsignedInt,
                            array.size_prefix_bits(),
                            format!("{}_count", path),
                        ));
                    }
                    for i in 0..array.max_size() {
                        let prefix = format!("{}_{}", path, i);
                        out.extend(template.iter().map(|c| UavcanChannel {
                            field_name: if c.is_void() { String::new() } else { join_path(&prefix, &c.field_name) },
                            ..c.clone()
                        }));
                    }
                }
                // Nested arrays and arrays of void are rejected by the parser.
                _ => {}
            }
        }
    }
}

/// Collect the integer constants of `type_name` as a node name to node id table.
pub fn node_ids(table: &TypeTable, type_name: &str) -> Result<BTreeMap<String, u32>, DsdlError> {
    let ty = table
        .get_by_name(type_name)
        .ok_or_else(|| DsdlError::UnknownType(type_name.to_string()))?;
    let mut nodes = BTreeMap::new();
    for constant in &ty.request_constants {
        match constant.value.as_u64().and_then(|v| u32::try_from(v).ok()) {
            Some(id) => {
                nodes.insert(constant.name.clone(), id);
            }
            None => warn!(
                constant = %constant.name,
                value = %constant.string_value(),
                "constant is not a valid node id, skipped"
            ),
        }
    }
    Ok(nodes)
}
