use std::fmt::{self, Display, Write as _};
use std::sync::Arc;

use super::enum8::EnumTable;
use super::registry::TypeRegistry;
use super::value::Value;
use super::ColumnError;

/// Family of an `AggregateFunction(...)` column whose state this crate decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// `quantile[s]TDigest[Weighted]`
    TDigest,
    /// `quantile[s]BFloat16[Weighted]`
    BFloat16,
    /// `quantile[s]Timing[Weighted]`
    Timing,
}

/// Parsed column type.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    FixedString(usize),
    Date,
    DateTime(Option<String>),
    /// Precision (0..=9) and optional timezone.
    DateTime64(u8, Option<String>),
    Uuid,
    Ipv4,
    Ipv6,
    Enum8(Arc<EnumTable>),
    Nullable(Box<ColumnType>),
    Array(Box<ColumnType>),
    LowCardinality(Box<ColumnType>),
    /// Alternatives in canonical (sorted by name) order.
    Variant(Vec<ColumnType>),
    Dynamic,
    AggregateFunction {
        kind: AggregateKind,
        /// Full type string, kept for display.
        declared: String,
    },
    Nothing,
}

impl ColumnType {
    /// Parses a type string without a registry. Named enums are not available.
    pub fn parse(type_name: &str) -> Result<ColumnType, ColumnError> {
        parse_type(type_name, None)
    }

    pub(crate) fn parse_with(
        type_name: &str,
        registry: &TypeRegistry,
    ) -> Result<ColumnType, ColumnError> {
        parse_type(type_name, Some(registry))
    }

    /// Type with Nullable removed, used for LowCardinality dictionaries.
    pub fn strip_nullable(&self) -> &ColumnType {
        match self {
            ColumnType::Nullable(inner) => inner,
            other => other,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, ColumnType::Nullable(_))
    }

    /// Whether `value` is of this type's native kind. Used to pick the alternative of
    /// a Variant column a value belongs to, so conversions are not considered.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ColumnType::Nullable(_), Value::Null) => true,
            (ColumnType::Nullable(inner), v) => inner.accepts(v),
            (ColumnType::LowCardinality(inner), v) => inner.accepts(v),
            (ColumnType::Array(inner), Value::Array(values)) => {
                values.iter().all(|v| inner.accepts(v))
            }
            (ColumnType::Enum8(table), Value::String(s)) => table.code(s).is_some(),
            (ColumnType::FixedString(width), Value::Bytes(b)) => b.len() <= *width,
            (ColumnType::DateTime64(..), Value::DateTime(_)) => true,
            (ColumnType::AggregateFunction { kind, .. }, v) => matches!(
                (kind, v),
                (AggregateKind::TDigest, Value::TDigest(_))
                    | (AggregateKind::BFloat16, Value::BFloat16Histogram(_))
                    | (AggregateKind::Timing, Value::QuantileTiming(_))
            ),
            (ty, v) => ty.scalar_name() == Some(v.kind_name()),
        }
    }

    fn scalar_name(&self) -> Option<&'static str> {
        Some(match self {
            ColumnType::Bool => "Bool",
            ColumnType::Int8 => "Int8",
            ColumnType::Int16 => "Int16",
            ColumnType::Int32 => "Int32",
            ColumnType::Int64 => "Int64",
            ColumnType::UInt8 => "UInt8",
            ColumnType::UInt16 => "UInt16",
            ColumnType::UInt32 => "UInt32",
            ColumnType::UInt64 => "UInt64",
            ColumnType::Float32 => "Float32",
            ColumnType::Float64 => "Float64",
            ColumnType::String => "String",
            ColumnType::Date => "Date",
            ColumnType::DateTime(_) => "DateTime",
            ColumnType::Uuid => "UUID",
            ColumnType::Ipv4 => "IPv4",
            ColumnType::Ipv6 => "IPv6",
            _ => return None,
        })
    }

    /// Natural column type of a value, used when a Dynamic column learns a new type.
    pub fn of_value(value: &Value) -> Option<ColumnType> {
        Some(match value {
            Value::Bool(_) => ColumnType::Bool,
            Value::Int8(_) => ColumnType::Int8,
            Value::Int16(_) => ColumnType::Int16,
            Value::Int32(_) => ColumnType::Int32,
            Value::Int64(_) => ColumnType::Int64,
            Value::UInt8(_) => ColumnType::UInt8,
            Value::UInt16(_) => ColumnType::UInt16,
            Value::UInt32(_) => ColumnType::UInt32,
            Value::UInt64(_) => ColumnType::UInt64,
            Value::Float32(_) => ColumnType::Float32,
            Value::Float64(_) => ColumnType::Float64,
            Value::String(_) => ColumnType::String,
            Value::Uuid(_) => ColumnType::Uuid,
            Value::Ipv4(_) => ColumnType::Ipv4,
            Value::Ipv6(_) => ColumnType::Ipv6,
            Value::Date(_) => ColumnType::Date,
            Value::DateTime(_) => ColumnType::DateTime64(9, None),
            Value::Array(values) => {
                let has_null = values.iter().any(Value::is_null);
                let elem = match values.iter().find(|v| !v.is_null()) {
                    Some(v) => ColumnType::of_value(v)?,
                    None => ColumnType::String,
                };
                if has_null {
                    ColumnType::Array(Box::new(ColumnType::Nullable(Box::new(elem))))
                } else {
                    ColumnType::Array(Box::new(elem))
                }
            }
            _ => return None,
        })
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.scalar_name() {
            if let ColumnType::DateTime(Some(tz)) = self {
                return write!(f, "DateTime('{tz}')");
            }
            return f.write_str(name);
        }
        match self {
            ColumnType::FixedString(n) => write!(f, "FixedString({n})"),
            ColumnType::DateTime64(p, None) => write!(f, "DateTime64({p})"),
            ColumnType::DateTime64(p, Some(tz)) => write!(f, "DateTime64({p}, '{tz}')"),
            ColumnType::Enum8(table) => write!(f, "{table}"),
            ColumnType::Nullable(inner) => write!(f, "Nullable({inner})"),
            ColumnType::Array(inner) => write!(f, "Array({inner})"),
            ColumnType::LowCardinality(inner) => write!(f, "LowCardinality({inner})"),
            ColumnType::Variant(types) => {
                f.write_str("Variant(")?;
                for (i, ty) in types.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_char(')')
            }
            ColumnType::Dynamic => f.write_str("Dynamic"),
            ColumnType::AggregateFunction { declared, .. } => f.write_str(declared),
            ColumnType::Nothing => f.write_str("Nothing"),
            _ => Ok(()),
        }
    }
}

fn bad(type_name: &str, reason: &'static str) -> ColumnError {
    ColumnError::BadType {
        type_name: type_name.to_owned(),
        reason,
    }
}

/// Splits `Name(args)` into the name and the raw argument text.
fn split_call(s: &str) -> Result<(&str, Option<&str>), ColumnError> {
    match s.find('(') {
        None => Ok((s, None)),
        Some(open) => {
            let args = s[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| bad(s, "missing closing parenthesis"))?;
            Ok((s[..open].trim(), Some(args)))
        }
    }
}

/// Splits arguments on top-level commas, skipping nested parentheses and quoted text.
pub(crate) fn split_args(args: &str) -> Result<Vec<&str>, ColumnError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| bad(args, "unbalanced parentheses"))?;
            }
            ',' if depth == 0 => {
                out.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || in_quote {
        return Err(bad(args, "unbalanced parentheses or quotes"));
    }
    let last = args[start..].trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last);
    }
    Ok(out)
}

/// Strips single quotes and resolves backslash escapes.
pub(crate) fn unquote(s: &str) -> Option<String> {
    let inner = s.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

fn one_arg<'a>(type_name: &str, args: Option<&'a str>) -> Result<&'a str, ColumnError> {
    let args = args.ok_or_else(|| bad(type_name, "missing type argument"))?;
    let args = split_args(args)?;
    match args.as_slice() {
        [arg] if !arg.is_empty() => Ok(arg),
        _ => Err(bad(type_name, "expected exactly one argument")),
    }
}

fn parse_type(type_name: &str, registry: Option<&TypeRegistry>) -> Result<ColumnType, ColumnError> {
    let s = type_name.trim();
    let (name, args) = split_call(s)?;
    let nested = |arg: &str| parse_type(arg, registry).map(Box::new);
    let ty = match (name, args) {
        ("Bool", None) => ColumnType::Bool,
        ("Int8", None) => ColumnType::Int8,
        ("Int16", None) => ColumnType::Int16,
        ("Int32", None) => ColumnType::Int32,
        ("Int64", None) => ColumnType::Int64,
        ("UInt8", None) => ColumnType::UInt8,
        ("UInt16", None) => ColumnType::UInt16,
        ("UInt32", None) => ColumnType::UInt32,
        ("UInt64", None) => ColumnType::UInt64,
        ("Float32", None) => ColumnType::Float32,
        ("Float64", None) => ColumnType::Float64,
        ("String", None) => ColumnType::String,
        ("UUID", None) => ColumnType::Uuid,
        ("IPv4", None) => ColumnType::Ipv4,
        ("IPv6", None) => ColumnType::Ipv6,
        ("Date", None) => ColumnType::Date,
        ("Dynamic", _) => ColumnType::Dynamic,
        ("Nothing", None) => ColumnType::Nothing,
        ("DateTime", None) => ColumnType::DateTime(None),
        ("DateTime", Some(arg)) => {
            let tz = unquote(arg).ok_or_else(|| bad(s, "timezone must be quoted"))?;
            ColumnType::DateTime(Some(tz))
        }
        ("DateTime64", args) => {
            let args = match args {
                Some(args) => split_args(args)?,
                None => Vec::new(),
            };
            let precision = match args.first() {
                Some(p) => p.parse::<u8>().map_err(|_| bad(s, "invalid precision"))?,
                None => 9,
            };
            if precision > 9 {
                return Err(bad(s, "precision must be at most 9"));
            }
            let tz = match args.get(1) {
                Some(tz) => Some(unquote(tz).ok_or_else(|| bad(s, "timezone must be quoted"))?),
                None => None,
            };
            ColumnType::DateTime64(precision, tz)
        }
        ("FixedString", args) => {
            let n = one_arg(s, args)?
                .parse::<usize>()
                .map_err(|_| bad(s, "invalid FixedString width"))?;
            ColumnType::FixedString(n)
        }
        ("Enum8", Some(args)) => {
            if let (Some(registry), false) = (registry, args.contains('=')) {
                let table = registry
                    .lookup_enum(args.trim())
                    .ok_or_else(|| bad(s, "unknown named enum"))?;
                ColumnType::Enum8(table)
            } else {
                ColumnType::Enum8(Arc::new(EnumTable::parse(args)?))
            }
        }
        ("Nullable", args) => ColumnType::Nullable(nested(one_arg(s, args)?)?),
        ("Array", args) => ColumnType::Array(nested(one_arg(s, args)?)?),
        ("LowCardinality", args) => ColumnType::LowCardinality(nested(one_arg(s, args)?)?),
        ("Variant", Some(args)) => {
            let mut types = split_args(args)?
                .into_iter()
                .map(|arg| parse_type(arg, registry))
                .collect::<Result<Vec<_>, _>>()?;
            if types.is_empty() || types.len() >= usize::from(super::NULL_DISCRIMINANT) {
                return Err(bad(s, "invalid number of alternatives"));
            }
            types.sort_by_cached_key(|ty| ty.to_string());
            ColumnType::Variant(types)
        }
        ("SimpleAggregateFunction", Some(args)) => match split_args(args)?.as_slice() {
            [_func, inner] => parse_type(inner, registry)?,
            _ => return Err(bad(s, "expected function and type")),
        },
        ("AggregateFunction", Some(args)) => {
            let func = split_args(args)?
                .first()
                .map(|f| split_call(f).map(|(name, _)| name))
                .transpose()?
                .unwrap_or_default();
            let base = func
                .trim_start_matches("quantiles")
                .trim_start_matches("quantile")
                .trim_end_matches("Weighted");
            let kind = match (func.starts_with("quantile"), base) {
                (true, "TDigest") => AggregateKind::TDigest,
                (true, "BFloat16") => AggregateKind::BFloat16,
                (true, "Timing") => AggregateKind::Timing,
                _ => return Err(ColumnError::UnsupportedType(s.to_owned())),
            };
            ColumnType::AggregateFunction {
                kind,
                declared: s.to_owned(),
            }
        }
        _ => return Err(ColumnError::UnsupportedType(s.to_owned())),
    };
    Ok(ty)
}
