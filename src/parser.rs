//! Parse DSDL (`.uavcan`) sources into compound types using PEST.
//!
//! Each non-blank line is matched on its own against the `line` rule in `grammar.pest`;
//! the `build_*` functions turn the resulting pairs into [`Field`]s and [`Constant`]s.
//! Referenced compound types are located on disk, parsed on demand and memoized in the
//! parser's [`TypeTable`].

use crate::source::{FileProvider, LocalFiles};
use crate::types::*;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct DsdlGrammar;

/// Schema error. Any of these aborts the whole parse or rule-generation pass.
#[derive(Debug, Error)]
pub enum DsdlError {
    #[error("{file}:{line}: {message}")]
    Syntax { file: String, line: usize, message: String },
    #[error("{file}: {message}")]
    File { file: String, message: String },
    #[error("DSDL root {0} could not be found")]
    RootNotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicate type name: {0}")]
    DuplicateType(String),
    #[error("duplicate {kind} subject id {subject_id}: {first} and {second}")]
    DuplicateSubjectId {
        kind: &'static str,
        subject_id: u32,
        first: String,
        second: String,
    },
    #[error("unknown type: {0}")]
    UnknownType(String),
}

fn syntax(file: &Path, line: usize, message: impl Into<String>) -> DsdlError {
    DsdlError::Syntax { file: file.display().to_string(), line, message: message.into() }
}

fn io_error(path: &Path, source: std::io::Error) -> DsdlError {
    DsdlError::Io { path: path.display().to_string(), source }
}

/// Identity encoded in a DSDL file name: `[<subjectId>.]<Name>[.<major>.<minor>].uavcan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub name: String,
    pub subject_id: u32,
    pub version: Version,
}

/// Split a DSDL base name into subject id, short name and version.
pub fn parse_file_name(basename: &str) -> Result<FileName, String> {
    let items: Vec<&str> = basename.split('.').collect();
    if !(2..=5).contains(&items.len()) || items.last() != Some(&"uavcan") {
        return Err(format!("{}: only .uavcan files can be parsed", basename));
    }
    let (subject_id, name) = match items.len() {
        2 | 4 => (0, items[0]),
        _ => {
            let id = items[0]
                .parse::<u32>()
                .map_err(|_| format!("{}: wrong data type id format, has to be an integer", basename))?;
            (id, items[1])
        }
    };
    if name.is_empty() {
        return Err(format!("{}: missing type name", basename));
    }
    let version = if items.len() >= 4 {
        let major = items[items.len() - 3].parse::<u32>();
        let minor = items[items.len() - 2].parse::<u32>();
        match (major, minor) {
            (Ok(major), Ok(minor)) => Version { major, minor },
            _ => return Err(format!("{}: wrong version syntax, has to be X.Y", basename)),
        }
    } else {
        Version::default()
    };
    Ok(FileName { name: name.to_string(), subject_id, version })
}

fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", namespace, name)
    }
}

/// `Name` and `Name.major.minor` inherit the referencing file's namespace.
fn is_unqualified(reference: &str) -> bool {
    let parts: Vec<&str> = reference.split('.').collect();
    parts.len() == 1 || (parts.len() == 3 && parts[2].parse::<u32>().is_ok())
}

fn is_dsdl_file(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "uavcan")
}

fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or("").trim()
}

/// Fields and constants of one side (request or response) of a definition.
#[derive(Default)]
struct Section {
    fields: Vec<Field>,
    constants: Vec<Constant>,
    union: bool,
    offset: u32,
}

impl Section {
    /// Compound fields start and end on a byte boundary; anonymous voids fill the gap.
    /// Fails when the section would no longer fit in `u32::MAX` bits.
    fn push_field(&mut self, field: Field, table: &TypeTable) -> Result<(), String> {
        let compound = field.ty.category() == Category::Compound;
        if compound {
            self.align()?;
        }
        self.offset = field
            .ty
            .checked_max_bit_length(table)
            .and_then(|len| self.offset.checked_add(len))
            .ok_or_else(|| format!("field {} overflows the maximum bit length of a section", field.name))?;
        self.fields.push(field);
        if compound {
            self.align()?;
        }
        Ok(())
    }

    fn align(&mut self) -> Result<(), String> {
        let rem = self.offset % 8;
        if rem != 0 {
            if let Ok(void) = VoidType::new(8 - rem) {
                self.offset = self
                    .offset
                    .checked_add(8 - rem)
                    .ok_or("padding overflows the maximum bit length of a section")?;
                self.fields.push(Field::padding(void));
            }
        }
        Ok(())
    }
}

/// Parses DSDL definitions below one root directory.
pub struct DsdlParser {
    root: PathBuf,
    provider: Box<dyn FileProvider>,
    table: TypeTable,
    in_progress: Vec<String>,
}

impl DsdlParser {
    /// Parser reading from the local file system.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_provider(root, LocalFiles)
    }

    pub fn with_provider(root: impl Into<PathBuf>, provider: impl FileProvider + 'static) -> Self {
        DsdlParser {
            root: root.into(),
            provider: Box::new(provider),
            table: TypeTable::new(),
            in_progress: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table(&self) -> &TypeTable {
        &self.table
    }

    pub fn into_table(self) -> TypeTable {
        self.table
    }

    /// Parse every `.uavcan` file below the root, replacing anything parsed before.
    ///
    /// All-or-nothing: on error the table is left empty.
    pub fn parse_all_directories(&mut self) -> Result<&TypeTable, DsdlError> {
        if !self.provider.is_dir(&self.root) {
            return Err(DsdlError::RootNotFound(self.root.display().to_string()));
        }
        self.table = TypeTable::new();
        self.in_progress.clear();
        if let Err(e) = self.parse_tree() {
            self.table = TypeTable::new();
            self.in_progress.clear();
            return Err(e);
        }
        info!(root = %self.root.display(), types = self.table.len(), "parsed DSDL tree");
        Ok(&self.table)
    }

    /// Only the highest version of each full name is parsed.
    fn parse_tree(&mut self) -> Result<(), DsdlError> {
        let mut files = Vec::new();
        self.collect_files(&self.root, &mut files)?;
        let mut order = Vec::new();
        let mut latest: HashMap<String, (Version, PathBuf)> = HashMap::new();
        for file in files {
            let (full_name, header) = self.file_header(&file)?;
            match latest.get(&full_name) {
                Some((version, _)) if *version >= header.version => {}
                Some(_) => {
                    latest.insert(full_name, (header.version, file));
                }
                None => {
                    order.push(full_name.clone());
                    latest.insert(full_name, (header.version, file));
                }
            }
        }
        for full_name in order {
            if self.table.contains(&full_name) {
                continue;
            }
            let Some((_, file)) = latest.remove(&full_name) else {
                continue;
            };
            let text = self.provider.read_to_string(&file).map_err(|e| io_error(&file, e))?;
            self.parse_source(&file, &text)?;
        }
        Ok(())
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DsdlError> {
        let files = self.provider.list_files(dir).map_err(|e| io_error(dir, e))?;
        out.extend(files.into_iter().filter(|f| is_dsdl_file(f)));
        for sub in self.provider.list_dirs(dir).map_err(|e| io_error(dir, e))? {
            self.collect_files(&sub, out)?;
        }
        Ok(())
    }

    /// Parse one definition. `filename` must lie below the root; its directory gives the namespace.
    pub fn parse_source(&mut self, filename: impl AsRef<Path>, source: &str) -> Result<TypeId, DsdlError> {
        let file = filename.as_ref();
        let (full_name, name) = self.file_header(file)?;
        if self.table.contains(&full_name) {
            return Err(DsdlError::DuplicateType(full_name));
        }
        self.in_progress.push(full_name.clone());
        let built = self.build_compound(file, &full_name, &name, source);
        self.in_progress.pop();
        let id = self
            .table
            .insert(built?)
            .map_err(|_| DsdlError::DuplicateType(full_name.clone()))?;
        debug!(file = %file.display(), type_name = %full_name, "parsed DSDL definition");
        Ok(id)
    }

    fn file_header(&self, file: &Path) -> Result<(String, FileName), DsdlError> {
        let file_error = |message: String| DsdlError::File { file: file.display().to_string(), message };
        let basename = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| file_error("missing file name".to_string()))?;
        let name = parse_file_name(basename).map_err(file_error)?;
        let namespace = self.namespace_of(file)?;
        Ok((qualify(&namespace, &name.name), name))
    }

    fn namespace_of(&self, file: &Path) -> Result<String, DsdlError> {
        let relative = file.strip_prefix(&self.root).map_err(|_| DsdlError::File {
            file: file.display().to_string(),
            message: format!("file is not under the DSDL root {}", self.root.display()),
        })?;
        let segments: Vec<String> = relative
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(segments.join("."))
    }

    fn build_compound(
        &mut self,
        file: &Path,
        full_name: &str,
        header: &FileName,
        source: &str,
    ) -> Result<CompoundType, DsdlError> {
        let mut request = Section::default();
        let mut response: Option<Section> = None;
        let mut names: HashSet<String> = HashSet::new();

        for (index, raw) in source.lines().enumerate() {
            let line = index + 1;
            let text = strip_comment(raw);
            if text.is_empty() {
                continue;
            }
            let pair = DsdlGrammar::parse(Rule::line, text)
                .map_err(|e| syntax(file, line, format!("invalid syntax: {}", e.variant.message())))?
                .next()
                .and_then(|p| p.into_inner().next())
                .ok_or_else(|| syntax(file, line, "empty line"))?;

            match pair.as_rule() {
                Rule::separator => {
                    if response.is_some() {
                        return Err(syntax(file, line, "a file can only have one request/response separator"));
                    }
                    response = Some(Section::default());
                    names.clear();
                }
                Rule::directive => {
                    let section = response.as_mut().unwrap_or(&mut request);
                    apply_directive(pair, section).map_err(|m| syntax(file, line, m))?;
                }
                Rule::attribute => {
                    let attr = self.build_attribute(pair, file, line)?;
                    if !attr.name().is_empty() && !names.insert(attr.name().to_string()) {
                        return Err(syntax(
                            file,
                            line,
                            format!("attribute name {} is already registered", attr.name()),
                        ));
                    }
                    let section = response.as_mut().unwrap_or(&mut request);
                    match attr {
                        Attribute::Constant(c) => section.constants.push(c),
                        Attribute::Field(f) => section.push_field(f, &self.table).map_err(|m| syntax(file, line, m))?,
                    }
                }
                other => return Err(syntax(file, line, format!("unexpected {:?}", other))),
            }
        }

        let kind = if response.is_some() { MessageKind::Service } else { MessageKind::Message };
        let mut ty = CompoundType::new(full_name, kind, header.subject_id, header.version);
        ty.request_fields = request.fields;
        ty.request_constants = request.constants;
        ty.request_union = request.union;
        if let Some(response) = response {
            ty.response_fields = response.fields;
            ty.response_constants = response.constants;
            ty.response_union = response.union;
        }
        Ok(ty)
    }

    fn build_attribute(&mut self, pair: Pair<Rule>, file: &Path, line: usize) -> Result<Attribute, DsdlError> {
        let mut cast_mode = CastMode::Saturated;
        let mut type_pair = None;
        let mut name = None;
        let mut expression = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::cast_mode => {
                    cast_mode = if inner.as_str() == "truncated" {
                        CastMode::Truncated
                    } else {
                        CastMode::Saturated
                    }
                }
                Rule::type_expr => type_pair = Some(inner),
                Rule::field_name => name = Some(inner.as_str().to_string()),
                Rule::expression => expression = Some(inner.as_str()),
                _ => {}
            }
        }
        let type_pair = type_pair.ok_or_else(|| syntax(file, line, "missing type"))?;
        let ty = self.build_type(type_pair, cast_mode, file, line)?;

        match (name, expression) {
            (None, _) => match ty {
                DsdlType::Void(void) => Ok(Attribute::Field(Field::padding(void))),
                _ => Err(syntax(file, line, "have you forgotten to name the field?")),
            },
            (Some(name), _) if ty.category() == Category::Void => {
                Err(syntax(file, line, format!("void field {} cannot be named", name)))
            }
            (Some(name), Some(expr)) => make_constant(ty, name, expr)
                .map(Attribute::Constant)
                .map_err(|m| syntax(file, line, m)),
            (Some(name), None) => Ok(Attribute::Field(Field::new(ty, name))),
        }
    }

    fn build_type(
        &mut self,
        pair: Pair<Rule>,
        cast_mode: CastMode,
        file: &Path,
        line: usize,
    ) -> Result<DsdlType, DsdlError> {
        let inner = pair.into_inner().next().ok_or_else(|| syntax(file, line, "empty type"))?;
        if inner.as_rule() != Rule::array_type {
            return self.build_scalar(inner, cast_mode, file, line);
        }
        let mut it = inner.into_inner();
        let element_pair = it.next().ok_or_else(|| syntax(file, line, "array: missing element type"))?;
        let bound = it.next().ok_or_else(|| syntax(file, line, "array: missing size"))?;
        let element = self.build_scalar(element_pair, cast_mode, file, line)?;
        if element.category() == Category::Void {
            return Err(syntax(file, line, "void cannot be used as an array element"));
        }
        let (mode, max_size) = parse_array_bound(bound).map_err(|m| syntax(file, line, m))?;
        let array = ArrayType::new(element, mode, max_size);
        if array.checked_max_bit_length(&self.table).is_none() {
            let definition = DsdlType::Array(array).definition(&self.table);
            return Err(syntax(file, line, format!("array {} is longer than {} bits", definition, u32::MAX)));
        }
        Ok(DsdlType::Array(array))
    }

    fn build_scalar(
        &mut self,
        pair: Pair<Rule>,
        cast_mode: CastMode,
        file: &Path,
        line: usize,
    ) -> Result<DsdlType, DsdlError> {
        match pair.as_rule() {
            Rule::void_type => {
                let bits = parse_number(pair).map_err(|m| syntax(file, line, m))?;
                VoidType::new(bits).map(DsdlType::Void).map_err(|m| syntax(file, line, m))
            }
            Rule::primitive_type => {
                let inner = pair.into_inner().next().ok_or_else(|| syntax(file, line, "empty primitive"))?;
                if inner.as_rule() == Rule::bool_type {
                    return Ok(DsdlType::Primitive(PrimitiveType::boolean(cast_mode)));
                }
                let mut it = inner.into_inner();
                let base = match it.next().map(|p| p.as_str()) {
                    Some("uint") => BaseType::UnsignedInt,
                    Some("int") => BaseType::SignedInt,
                    Some("float") => BaseType::Float,
                    _ => return Err(syntax(file, line, "datatype has to be int, uint, bool or float")),
                };
                let bits = it
                    .next()
                    .and_then(|p| p.as_str().parse::<u32>().ok())
                    .ok_or_else(|| syntax(file, line, "invalid bit length"))?;
                PrimitiveType::new(base, bits, cast_mode)
                    .map(DsdlType::Primitive)
                    .map_err(|m| syntax(file, line, m))
            }
            Rule::compound_ref => self.resolve_compound(pair.as_str(), file, line).map(DsdlType::Compound),
            other => Err(syntax(file, line, format!("unexpected type {:?}", other))),
        }
    }

    /// Find, parse (once) and return the compound type a field refers to.
    fn resolve_compound(&mut self, reference: &str, file: &Path, line: usize) -> Result<TypeId, DsdlError> {
        let qualified = if is_unqualified(reference) {
            qualify(&self.namespace_of(file)?, reference)
        } else {
            reference.to_string()
        };
        let parts: Vec<&str> = qualified.split('.').collect();
        let versioned = parts.len() >= 3 && parts[parts.len() - 1].parse::<u32>().is_ok();
        let (namespace, short_name, wanted) = if versioned {
            let major = parts[parts.len() - 2]
                .parse::<u32>()
                .map_err(|_| syntax(file, line, format!("invalid version in reference {}", reference)))?;
            let minor = parts[parts.len() - 1].parse::<u32>().unwrap_or_default();
            (&parts[..parts.len() - 3], parts[parts.len() - 3], Some(Version { major, minor }))
        } else {
            (&parts[..parts.len() - 1], parts[parts.len() - 1], None)
        };

        let dir = namespace.iter().fold(self.root.clone(), |d, s| d.join(s));
        if !self.provider.is_dir(&dir) {
            return Err(syntax(
                file,
                line,
                format!("unknown namespace ({}) for {}", namespace.join("."), reference),
            ));
        }
        let mut candidates: Vec<(Version, PathBuf)> = self
            .provider
            .list_files(&dir)
            .map_err(|e| io_error(&dir, e))?
            .into_iter()
            .filter(|f| is_dsdl_file(f))
            .filter_map(|f| {
                let header = parse_file_name(f.file_name()?.to_str()?).ok()?;
                (header.name == short_name).then_some((header.version, f))
            })
            .collect();
        candidates.sort_by_key(|(v, _)| *v);
        // one version per full name is loaded: the highest
        let chosen = candidates
            .last()
            .map(|(_, path)| path.clone())
            .ok_or_else(|| syntax(file, line, format!("unknown compound type {}", reference)))?;

        let full_name = qualify(&namespace.join("."), short_name);
        let id = match self.table.lookup(&full_name) {
            Some(id) => id,
            None => {
                if self.in_progress.contains(&full_name) {
                    return Err(syntax(
                        file,
                        line,
                        format!("recursive type reference: {} -> {}", self.in_progress.join(" -> "), full_name),
                    ));
                }
                let text = self.provider.read_to_string(&chosen).map_err(|e| io_error(&chosen, e))?;
                self.parse_source(&chosen, &text)?
            }
        };
        if let Some(wanted) = wanted {
            let loaded = self.table[id].version;
            if loaded != wanted {
                return Err(syntax(
                    file,
                    line,
                    format!(
                        "{} asks for version {} but {} is loaded at version {}",
                        reference, wanted, full_name, loaded
                    ),
                ));
            }
        }
        if self.table[id].is_service() {
            return Err(syntax(
                file,
                line,
                format!("service type {} cannot be embedded in another type", full_name),
            ));
        }
        Ok(id)
    }
}

/// Parse every definition under `root` on the local file system.
pub fn parse_all_under(root: impl Into<PathBuf>) -> Result<TypeTable, DsdlError> {
    let mut parser = DsdlParser::new(root);
    parser.parse_all_directories()?;
    Ok(parser.into_table())
}

fn apply_directive(pair: Pair<Rule>, section: &mut Section) -> Result<(), String> {
    let mut name = "";
    let mut has_arg = false;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::directive_name => name = inner.as_str(),
            Rule::directive_arg => has_arg = true,
            _ => {}
        }
    }
    match (name, has_arg) {
        ("union", false) => {
            section.union = true;
            Ok(())
        }
        ("assert", _) | ("sealed", false) => Ok(()),
        _ => Err(format!("unknown directive @{}", name)),
    }
}

fn parse_number(pair: Pair<Rule>) -> Result<u32, String> {
    let text = pair
        .into_inner()
        .find(|p| p.as_rule() == Rule::number)
        .map(|p| p.as_str())
        .ok_or("missing number")?;
    text.parse().map_err(|_| format!("number {} out of range", text))
}

fn parse_array_bound(pair: Pair<Rule>) -> Result<(ArrayMode, u32), String> {
    let bound = pair.into_inner().next().ok_or("array: missing size")?;
    let rule = bound.as_rule();
    let n = parse_number(bound)?;
    let (mode, max_size) = match rule {
        Rule::bound_le => (ArrayMode::Dynamic, n),
        Rule::bound_lt => (ArrayMode::Dynamic, n.saturating_sub(1)),
        _ => (ArrayMode::Static, n),
    };
    if max_size == 0 {
        return Err("syntax error on array definition, size has to be at least 1".to_string());
    }
    Ok((mode, max_size))
}

fn make_constant(ty: DsdlType, name: String, expression: &str) -> Result<Constant, String> {
    let DsdlType::Primitive(primitive) = ty else {
        return Err(format!("constant {} has to be a primitive type", name));
    };
    let expression: String = expression.split_whitespace().collect();
    let value = evaluate_literal(&expression, &primitive)?;
    let (min, max) = primitive.value_range();
    let v = value.as_f64();
    if v < min || v > max {
        return Err(format!("constant {} = {} is out of range for {}", name, expression, primitive));
    }
    Ok(Constant { name, ty: primitive, value, expression })
}

/// Evaluate a constant initializer under the constant's base type.
pub fn evaluate_literal(expr: &str, ty: &PrimitiveType) -> Result<ConstantValue, String> {
    match ty.base_type() {
        BaseType::Boolean => match expr.to_ascii_lowercase().as_str() {
            "true" => Ok(ConstantValue::Bool(true)),
            "false" => Ok(ConstantValue::Bool(false)),
            _ => Err(format!("invalid boolean literal {}", expr)),
        },
        BaseType::Float => match expr.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(ConstantValue::Float(v)),
            _ => Err(format!("invalid float literal {}", expr)),
        },
        BaseType::SignedInt => {
            let (negative, digits) = match expr.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, expr.strip_prefix('+').unwrap_or(expr)),
            };
            let magnitude = i128::from(parse_unsigned(digits)?);
            let value = if negative { -magnitude } else { magnitude };
            i64::try_from(value)
                .map(ConstantValue::SignedInt)
                .map_err(|_| format!("integer literal {} does not fit in 64 bits", expr))
        }
        BaseType::UnsignedInt => {
            if expr.starts_with('\'') {
                char_literal(expr).map(ConstantValue::UnsignedInt)
            } else {
                parse_unsigned(expr).map(ConstantValue::UnsignedInt)
            }
        }
        BaseType::Void => Err("void cannot hold a constant".to_string()),
    }
}

fn parse_unsigned(text: &str) -> Result<u64, String> {
    let (radix, digits) = if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (16, rest)
    } else if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        (2, rest)
    } else if let Some(rest) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        (8, rest)
    } else {
        (10, text)
    };
    u64::from_str_radix(digits, radix).map_err(|_| format!("invalid integer literal {}", text))
}

fn char_literal(expr: &str) -> Result<u64, String> {
    let invalid = || format!("invalid character literal {}", expr);
    let inner = expr
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(invalid)?;
    let mut chars = inner.chars();
    let c = match (chars.next(), chars.next(), chars.next()) {
        (Some('\\'), Some(escape), None) => match escape {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            _ => return Err(invalid()),
        },
        (Some(c), None, _) => c,
        _ => return Err(invalid()),
    };
    Ok(u64::from(u32::from(c)))
}
