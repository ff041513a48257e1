//! The closed [`Value`] variant type for discrete variables and cache
//! entries.
//!
//! Discrete variables and explicitly allocated cache entries hold
//! opaque typed payloads. Rather than a downcastable base type, the
//! payload is a closed tagged variant: the set of representable kinds
//! is fixed here, and every access site matches on it. Mismatches are
//! ordinary `Option`s, never runtime type inspection.

use std::fmt;

/// Classification of a [`Value`]'s payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// A boolean flag.
    Bool,
    /// A signed integer.
    Int,
    /// A single floating-point scalar.
    Real,
    /// A fixed-length vector of floating-point scalars.
    RealVec,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Real => "real",
            ValueKind::RealVec => "real-vec",
        };
        write!(f, "{name}")
    }
}

/// A typed payload stored in a discrete variable or cache entry.
///
/// Ownership of a `Value` transfers to the container at allocation
/// time; numerical algorithms read and write it through the
/// container's accessors.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A boolean flag (e.g. a contact on/off switch).
    Bool(bool),
    /// A signed integer (e.g. a mode selector).
    Int(i64),
    /// A floating-point scalar.
    Real(f64),
    /// A vector of floating-point scalars (e.g. a stored impulse).
    RealVec(Vec<f64>),
}

impl Value {
    /// The kind tag of this payload.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Real(_) => ValueKind::Real,
            Value::RealVec(_) => ValueKind::RealVec,
        }
    }

    /// The boolean payload, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The scalar payload, if this is a `Real`.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// The vector payload, if this is a `RealVec`.
    pub fn as_real_vec(&self) -> Option<&[f64]> {
        match self {
            Value::RealVec(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable access to the vector payload, if this is a `RealVec`.
    pub fn as_real_vec_mut(&mut self) -> Option<&mut Vec<f64>> {
        match self {
            Value::RealVec(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::RealVec(v) => {
                write!(f, "[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
        }
    }
}
