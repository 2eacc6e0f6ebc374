use std::fmt;
use std::ops::{BitAnd, BitOr, Sub};

/// Composite query operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Diff,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::And => "&",
            Operator::Or => "|",
            Operator::Diff => "-",
        }
    }
}

/// Property comparison kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    ApproxIncludes,
    Equal,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::ApproxIncludes => ":",
            Comparison::Equal => "=",
            Comparison::LessThan => "<",
            Comparison::GreaterThan => ">",
            Comparison::LessOrEqual => "<=",
            Comparison::GreaterOrEqual => ">=",
        }
    }

    /// Mirror an ordering comparison so its operands can be swapped:
    /// `A < name` restated as `name > A`. Identity for the others.
    pub fn swapped(&self) -> Comparison {
        match self {
            Comparison::LessThan => Comparison::GreaterThan,
            Comparison::GreaterThan => Comparison::LessThan,
            Comparison::LessOrEqual => Comparison::GreaterOrEqual,
            Comparison::GreaterOrEqual => Comparison::LessOrEqual,
            other => *other,
        }
    }

    pub fn is_ordering(&self) -> bool {
        !matches!(self, Comparison::ApproxIncludes | Comparison::Equal)
    }
}

/// Immutable boolean/attribute query tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Identity element of the merge algebra
    Null,
    /// Free-text phrase or word
    Term(String),
    /// Attribute constraint against the fixed schema
    Property {
        name: String,
        value: String,
        cmp: Comparison,
    },
    /// Flag membership test against the denormalized flags attribute
    Flag(String),
    /// Negated flag membership test
    NoFlag(String),
    /// And/Or/Diff over two or more operands
    Composite {
        op: Operator,
        operands: Vec<Query>,
    },
}

impl Query {
    pub fn term(value: impl Into<String>) -> Query {
        Query::Term(value.into())
    }

    pub fn property(name: impl Into<String>, value: impl Into<String>, cmp: Comparison) -> Query {
        Query::Property {
            name: name.into(),
            value: value.into(),
            cmp,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Query::Null)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Query::Composite { .. })
    }

    /// Merge algebra: `Null` is the identity; merging into a composite of
    /// the same operator appends (single-level flattening only); anything
    /// else starts a fresh two-operand composite.
    pub fn merge(self, other: Query, op: Operator) -> Query {
        match self {
            Query::Null => other,
            Query::Composite {
                op: existing,
                mut operands,
            } if existing == op => {
                operands.push(other);
                Query::Composite { op, operands }
            }
            this => Query::Composite {
                op,
                operands: vec![this, other],
            },
        }
    }
}

impl BitAnd for Query {
    type Output = Query;

    fn bitand(self, other: Query) -> Query {
        self.merge(other, Operator::And)
    }
}

impl BitOr for Query {
    type Output = Query;

    fn bitor(self, other: Query) -> Query {
        self.merge(other, Operator::Or)
    }
}

impl Sub for Query {
    type Output = Query;

    fn sub(self, other: Query) -> Query {
        self.merge(other, Operator::Diff)
    }
}

/// Quote a value for the canonical text form, escaping `"` and `\`
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Query::Null => Ok(()),
            Query::Term(value) => write!(f, "{}", quote(value)),
            Query::Property { name, value, cmp } => {
                write!(f, "{} {} {}", name, cmp.symbol(), quote(value))
            }
            Query::Flag(flag) => write!(f, "flag : {}", quote(flag)),
            Query::NoFlag(flag) => write!(f, "noflag : {}", quote(flag)),
            Query::Composite { op, operands } => {
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.symbol())?;
                    }
                    if operand.is_composite() {
                        write!(f, "( {} )", operand)?;
                    } else {
                        write!(f, "{}", operand)?;
                    }
                }
                Ok(())
            }
        }
    }
}
