//! Schema constraints.
//!
//! A constraint is consulted at three points:
//!
//! - [`Constraint::check_token`] before a token's body is buffered, so an
//!   oversized string is refused from its header alone.
//! - [`Constraint::check_opentype`] once an OPEN's index tokens name the
//!   composite being opened.
//! - [`Constraint::check_value`] on whole values, used for local argument
//!   validation and for resolved references.

use banana_proto::{TokenType, Violation};

use crate::value::Value;

/// Recursion limit for [`Constraint::check_value`] on shared graphs.
const MAX_CHECK_DEPTH: usize = 64;

/// What a position in a value graph may hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Anything the registry can decode
    Any,
    /// `none`
    Nothing,
    /// `boolean`
    Bool,
    /// Integer whose LONGINT body is at most `max_bytes` long
    Int {
        /// Largest accepted LONGINT/LONGNEG body
        max_bytes: usize,
    },
    /// FLOAT, or an integer
    Number,
    /// STRING of at most `max_length` bytes
    Bytes {
        /// Largest accepted body
        max_length: usize,
    },
    /// `unicode` of at most `max_length` encoded bytes
    Text {
        /// Largest accepted UTF-8 body
        max_length: usize,
    },
    /// `list` of items matching `item`
    List {
        /// Constraint on every item
        item: Box<Constraint>,
        /// Maximum number of items
        max_length: usize,
    },
    /// `tuple` with per-position constraints
    Tuple(Vec<Constraint>),
    /// `dict` with key and value constraints
    Dict {
        /// Constraint on keys
        key: Box<Constraint>,
        /// Constraint on values
        value: Box<Constraint>,
        /// Maximum number of entries
        max_keys: usize,
    },
    /// Any one of the alternatives
    Choice(Vec<Constraint>),
    /// `none` or the inner constraint
    Optional(Box<Constraint>),
    /// Host opentypes accepted by name (for example remote references)
    Opentypes(Vec<&'static str>),
}

impl Constraint {
    /// Integer that fits in 64 bits.
    pub fn int() -> Self {
        Self::Int { max_bytes: 8 }
    }

    /// Byte string of at most 1000 bytes.
    pub fn bytes() -> Self {
        Self::Bytes { max_length: 1000 }
    }

    /// Text of at most 1000 bytes.
    pub fn text() -> Self {
        Self::Text { max_length: 1000 }
    }

    /// List of up to `max_length` items matching `item`.
    pub fn list_of(item: Constraint, max_length: usize) -> Self {
        Self::List { item: Box::new(item), max_length }
    }

    /// Dict of up to `max_keys` entries.
    pub fn dict_of(key: Constraint, value: Constraint, max_keys: usize) -> Self {
        Self::Dict { key: Box::new(key), value: Box::new(value), max_keys }
    }

    /// `none` or `inner`.
    pub fn optional(inner: Constraint) -> Self {
        Self::Optional(Box::new(inner))
    }

    fn describe(&self) -> String {
        match self {
            Self::Any => "any".into(),
            Self::Nothing => "none".into(),
            Self::Bool => "boolean".into(),
            Self::Int { .. } => "int".into(),
            Self::Number => "number".into(),
            Self::Bytes { .. } => "string".into(),
            Self::Text { .. } => "unicode".into(),
            Self::List { .. } => "list".into(),
            Self::Tuple(_) => "tuple".into(),
            Self::Dict { .. } => "dict".into(),
            Self::Choice(options) => {
                let names: Vec<String> = options.iter().map(Self::describe).collect();
                format!("one of ({})", names.join(", "))
            },
            Self::Optional(inner) => format!("optional {}", inner.describe()),
            Self::Opentypes(names) => names.join("|"),
        }
    }

    fn reject(&self, got: &str) -> Violation {
        Violation::new(format!("expected {}, got {got}", self.describe()))
    }

    /// Accept or refuse a token before its body is read.
    ///
    /// `size` is the header: a length for sized bodies, the magnitude for
    /// INT/NEG, the reference index for OPEN.
    pub fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        use TokenType as T;
        match (self, token) {
            (Self::Any, _) => Ok(()),
            (Self::Int { .. } | Self::Number, T::Int | T::Neg) => Ok(()),
            (Self::Int { max_bytes }, T::LongInt | T::LongNeg) => {
                if size > *max_bytes as u64 {
                    Err(Violation::new(format!("integer of {size} bytes exceeds {max_bytes}")))
                } else {
                    Ok(())
                }
            },
            (Self::Number, T::Float | T::LongInt | T::LongNeg) => Ok(()),
            (Self::Bytes { .. }, T::Vocab) => Ok(()),
            (Self::Bytes { max_length }, T::String) => {
                if size > *max_length as u64 {
                    Err(Violation::new(format!("string of {size} bytes exceeds {max_length}")))
                } else {
                    Ok(())
                }
            },
            (
                Self::Nothing
                | Self::Bool
                | Self::Text { .. }
                | Self::List { .. }
                | Self::Tuple(_)
                | Self::Dict { .. }
                | Self::Opentypes(_),
                T::Open,
            ) => Ok(()),
            (Self::Optional(_), T::Open) => Ok(()),
            (Self::Optional(inner), _) => inner.check_token(token, size),
            (Self::Choice(options), _) => {
                if options.iter().any(|c| c.check_token(token, size).is_ok()) {
                    Ok(())
                } else {
                    Err(self.reject(token.name()))
                }
            },
            _ => Err(self.reject(token.name())),
        }
    }

    /// Accept or refuse an opentype once its name is known.
    ///
    /// `reference` is always accepted where a shared composite could
    /// appear; the referenced value is checked with
    /// [`Constraint::check_value`] once resolved.
    pub fn check_opentype(&self, opentype: &str) -> Result<(), Violation> {
        let ok = match self {
            Self::Any => true,
            Self::Nothing => opentype == "none",
            Self::Bool => opentype == "boolean",
            Self::Text { .. } => opentype == "unicode",
            Self::List { .. } => matches!(opentype, "list" | "reference"),
            Self::Tuple(_) => matches!(opentype, "tuple" | "reference"),
            Self::Dict { .. } => matches!(opentype, "dict" | "reference"),
            Self::Opentypes(names) => names.contains(&opentype),
            Self::Optional(inner) => opentype == "none" || inner.check_opentype(opentype).is_ok(),
            Self::Choice(options) => options.iter().any(|c| c.check_opentype(opentype).is_ok()),
            Self::Int { .. } | Self::Number | Self::Bytes { .. } => false,
        };
        if ok { Ok(()) } else { Err(self.reject(&format!("opentype {opentype}"))) }
    }

    /// Check a complete value.
    pub fn check_value(&self, value: &Value) -> Result<(), Violation> {
        self.check_value_at(value, 0)
    }

    fn check_value_at(&self, value: &Value, depth: usize) -> Result<(), Violation> {
        if depth > MAX_CHECK_DEPTH {
            return Ok(());
        }
        match (self, value) {
            (Self::Any, _) | (Self::Nothing, Value::None) | (Self::Bool, Value::Bool(_)) => Ok(()),
            (_, Value::Deferred(_)) => Ok(()),
            (Self::Int { max_bytes }, Value::Int(v)) => {
                let width = banana_proto::number::magnitude_to_bytes(v.unsigned_abs()).len();
                if v.unsigned_abs() < banana_proto::INT_CUTOVER as u128 || width <= *max_bytes {
                    Ok(())
                } else {
                    Err(Violation::new(format!("integer of {width} bytes exceeds {max_bytes}")))
                }
            },
            (Self::Number, Value::Int(_) | Value::Float(_)) => Ok(()),
            (Self::Bytes { max_length }, Value::Bytes(b)) => check_length(b.len(), *max_length),
            (Self::Text { max_length }, Value::Text(s)) => check_length(s.len(), *max_length),
            (Self::List { item, max_length }, Value::List(list)) => {
                let items = list.snapshot();
                check_length(items.len(), *max_length)?;
                items.iter().try_for_each(|v| item.check_value_at(v, depth + 1))
            },
            (Self::Tuple(slots), Value::Tuple(tuple)) => {
                if slots.len() != tuple.items().len() {
                    return Err(Violation::new(format!(
                        "expected tuple of {} items, got {}",
                        slots.len(),
                        tuple.items().len()
                    )));
                }
                slots.iter().zip(tuple.items()).try_for_each(|(c, v)| c.check_value_at(v, depth + 1))
            },
            (Self::Dict { key, value: value_constraint, max_keys }, Value::Dict(dict)) => {
                let entries = dict.snapshot();
                check_length(entries.len(), *max_keys)?;
                entries.into_iter().try_for_each(|(k, v)| {
                    key.check_value_at(&Value::from(k), depth + 1)?;
                    value_constraint.check_value_at(&v, depth + 1)
                })
            },
            (Self::Optional(_), Value::None) => Ok(()),
            (Self::Optional(inner), v) => inner.check_value_at(v, depth),
            (Self::Choice(options), v) => {
                if options.iter().any(|c| c.check_value_at(v, depth).is_ok()) {
                    Ok(())
                } else {
                    Err(self.reject(v.kind()))
                }
            },
            (Self::Opentypes(_), Value::Object(_)) => Ok(()),
            (_, v) => Err(self.reject(v.kind())),
        }
    }
}

fn check_length(length: usize, max: usize) -> Result<(), Violation> {
    if length > max {
        Err(Violation::new(format!("length {length} exceeds {max}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_size_checked_from_header() {
        let c = Constraint::Bytes { max_length: 10 };
        assert!(c.check_token(TokenType::String, 10).is_ok());
        assert!(c.check_token(TokenType::String, 11).is_err());
        assert!(c.check_token(TokenType::Int, 1).is_err());
    }

    #[test]
    fn composites_need_open_and_matching_opentype() {
        let c = Constraint::list_of(Constraint::int(), 3);
        assert!(c.check_token(TokenType::Open, 0).is_ok());
        assert!(c.check_token(TokenType::String, 1).is_err());
        assert!(c.check_opentype("list").is_ok());
        assert!(c.check_opentype("reference").is_ok());
        assert!(c.check_opentype("dict").is_err());
    }

    #[test]
    fn long_int_width() {
        let c = Constraint::int();
        assert!(c.check_token(TokenType::LongInt, 8).is_ok());
        assert!(c.check_token(TokenType::LongNeg, 9).is_err());
        assert!(c.check_value(&Value::Int(i128::from(i64::MAX))).is_ok());
        assert!(c.check_value(&Value::Int(i128::MAX)).is_err());
    }

    #[test]
    fn optional_accepts_none() {
        let c = Constraint::optional(Constraint::bytes());
        assert!(c.check_opentype("none").is_ok());
        assert!(c.check_token(TokenType::String, 5).is_ok());
        assert!(c.check_value(&Value::None).is_ok());
        assert!(c.check_value(&Value::Int(1)).is_err());
    }

    #[test]
    fn choice_takes_any_alternative() {
        let c = Constraint::Choice(vec![Constraint::int(), Constraint::text()]);
        assert!(c.check_token(TokenType::Int, 4).is_ok());
        assert!(c.check_token(TokenType::Open, 0).is_ok());
        assert!(c.check_opentype("unicode").is_ok());
        assert!(c.check_token(TokenType::Float, 0).is_err());
    }

    #[test]
    fn list_value_checks_items_and_length() {
        let c = Constraint::list_of(Constraint::int(), 2);
        assert!(c.check_value(&Value::list([Value::Int(1), Value::Int(2)])).is_ok());
        assert!(c.check_value(&Value::list([Value::Int(1), Value::from("x")])).is_err());
        assert!(c.check_value(&Value::list([Value::Int(1), Value::Int(2), Value::Int(3)])).is_err());
    }
}
