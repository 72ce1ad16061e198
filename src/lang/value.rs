use serde::{Deserialize, Serialize};

/// Static and runtime type tag of a VeryBasic value.
///
/// The discriminant doubles as the tag byte written into bytecode operands
/// (`Push`, `Convert`, `GetItem`), so the order here is part of the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VBType {
    Number = 0,
    String = 1,
    Boolean = 2,
    List = 3,
    Void = 4,
}

impl VBType {
    pub fn from_byte(byte: u8) -> Option<VBType> {
        Some(match byte {
            0 => VBType::Number,
            1 => VBType::String,
            2 => VBType::Boolean,
            3 => VBType::List,
            4 => VBType::Void,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether `Convert` may turn a value of `self` into `target`.
    pub fn converts_to(self, target: VBType) -> bool {
        use VBType::*;
        self == target
            || matches!(
                (self, target),
                (Number, String) | (String, Number) | (Boolean, String) | (String, Boolean)
            )
    }

    /// Name used in user-facing diagnostics ("a number", "a list").
    pub fn describe(self) -> &'static str {
        match self {
            VBType::Number => "a number",
            VBType::String => "a string",
            VBType::Boolean => "a boolean",
            VBType::List => "a list",
            VBType::Void => "nothing",
        }
    }
}

impl std::fmt::Display for VBType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VBType::Number => "number",
            VBType::String => "string",
            VBType::Boolean => "boolean",
            VBType::List => "list",
            VBType::Void => "void",
        };
        write!(f, "{}", name)
    }
}

/// Runtime value in the VeryBasic language.
///
/// Values are plain data: no references, no cycles. `Void` is the value of a
/// statement that produces nothing and never reaches the bytecode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Void,
}

/// Why a runtime conversion could not be performed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionError {
    pub value: Value,
    pub target: VBType,
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Value::String(s) => write!(f, "I can't turn \"{}\" into {}", s, self.target.describe()),
            other => write!(
                f,
                "I can't turn {} into {}",
                other.vb_type().describe(),
                self.target.describe()
            ),
        }
    }
}

impl Value {
    pub fn vb_type(&self) -> VBType {
        match self {
            Value::Number(_) => VBType::Number,
            Value::String(_) => VBType::String,
            Value::Boolean(_) => VBType::Boolean,
            Value::List(_) => VBType::List,
            Value::Void => VBType::Void,
        }
    }

    /// Value a declaration without an initializer starts with.
    pub fn default_for(ty: VBType) -> Option<Value> {
        match ty {
            VBType::Number => Some(Value::Number(0.0)),
            VBType::String => Some(Value::String(String::new())),
            VBType::Boolean => Some(Value::Boolean(false)),
            VBType::List => Some(Value::List(Vec::new())),
            VBType::Void => None,
        }
    }

    /// Explicit conversion performed by the `Convert` opcode.
    ///
    /// Identity conversions always succeed; the compiler rejects every pair
    /// outside [`VBType::converts_to`] before this can be reached.
    pub fn convert(self, target: VBType) -> Result<Value, ConversionError> {
        if self.vb_type() == target {
            return Ok(self);
        }

        match (self, target) {
            (Value::Number(n), VBType::String) => Ok(Value::String(format_number(n))),
            (Value::Boolean(b), VBType::String) => Ok(Value::String(b.to_string())),
            (Value::String(s), VBType::Number) => match s.trim().parse::<f64>() {
                Ok(n) => Ok(Value::Number(n)),
                Err(_) => Err(ConversionError {
                    value: Value::String(s),
                    target,
                }),
            },
            (Value::String(s), VBType::Boolean) => {
                let word = s.trim();
                if word.eq_ignore_ascii_case("true") || word.eq_ignore_ascii_case("yes") {
                    Ok(Value::Boolean(true))
                } else if word.eq_ignore_ascii_case("false") || word.eq_ignore_ascii_case("no") {
                    Ok(Value::Boolean(false))
                } else {
                    Err(ConversionError {
                        value: Value::String(s),
                        target,
                    })
                }
            }
            (value, target) => Err(ConversionError { value, target }),
        }
    }
}

/// Whole numbers print without a fractional part: `3`, not `3.0`.
pub fn format_number(n: f64) -> String {
    format!("{}", n)
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Void => write!(f, "nothing"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
