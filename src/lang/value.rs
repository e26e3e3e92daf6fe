use serde::{Deserialize, Serialize};

/// Runtime value in the Zephyr language.
///
/// Values live in chunk constant pools, on the VM operand stack and in each
/// entity's variable table. Assignment always replaces the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit floating-point number.
    Number(f64),

    /// Two-component vector: `3,4`.
    Vec2 { x: f64, y: f64 },

    /// Boolean value.
    Bool(bool),

    /// UTF-8 string value.
    String(String),
}

/// The static kind of a [`Value`], used for typed `var` declarations and
/// fault messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Number,
    Vec2,
    Bool,
    String,
}

impl ValueType {
    /// Parses a type annotation as written in source (`var hp: Number;`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Number" => Some(ValueType::Number),
            "Vec2" => Some(ValueType::Vec2),
            "Bool" => Some(ValueType::Bool),
            "String" => Some(ValueType::String),
            _ => None,
        }
    }

    /// The value an unset variable of this type reads as.
    pub fn default_value(self) -> Value {
        match self {
            ValueType::Number => Value::Number(0.0),
            ValueType::Vec2 => Value::Vec2 { x: 0.0, y: 0.0 },
            ValueType::Bool => Value::Bool(false),
            ValueType::String => Value::String(String::new()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Number => "number",
            ValueType::Vec2 => "vec2",
            ValueType::Bool => "bool",
            ValueType::String => "string",
        }
    }
}

impl Value {
    pub fn vec2(x: f64, y: f64) -> Self {
        Value::Vec2 { x, y }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Number(_) => ValueType::Number,
            Value::Vec2 { .. } => ValueType::Vec2,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    /// Identity used for constant-pool interning.
    ///
    /// Unlike `==`, numbers compare bitwise so `0` and `-0` keep separate
    /// slots.
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Vec2 { x: ax, y: ay }, Value::Vec2 { x: bx, y: by }) => {
                ax.to_bits() == bx.to_bits() && ay.to_bits() == by.to_bits()
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
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
        Value::Bool(b)
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

impl std::fmt::Display for Value {
    /// Format a value using Zephyr surface syntax.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Vec2 { x, y } => write!(f, "{},{}", x, y),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "\"{}\"", s),
        }
    }
}
