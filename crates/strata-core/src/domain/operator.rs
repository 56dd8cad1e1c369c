use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{fmt, str::FromStr};
use thiserror::Error as ThisError;

///
/// Operator
///
/// Condition operator vocabulary. The *standard* subset survives
/// optimization; everything else is sugar that rewrites into it:
///
/// - `=` / `!=` become single-element `in` / `not in`
/// - `=?` is "equals, or true when the value is not set"
/// - `parent_of` / `child_of` resolve through the hierarchy relation
///
/// Deprecated aliases `==` and `<>` are accepted on parsing with a warning.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    Like,
    NotLike,
    Ilike,
    NotIlike,
    EqLike,
    NotEqLike,
    EqIlike,
    NotEqIlike,
    Any,
    NotAny,
    EqIfSet,
    ParentOf,
    ChildOf,
}

///
/// OperatorParseError
///

#[derive(Debug, Eq, PartialEq, ThisError)]
#[error("unknown operator '{0}'")]
pub struct OperatorParseError(pub String);

impl Operator {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Like => "like",
            Self::NotLike => "not like",
            Self::Ilike => "ilike",
            Self::NotIlike => "not ilike",
            Self::EqLike => "=like",
            Self::NotEqLike => "not =like",
            Self::EqIlike => "=ilike",
            Self::NotEqIlike => "not =ilike",
            Self::Any => "any",
            Self::NotAny => "not any",
            Self::EqIfSet => "=?",
            Self::ParentOf => "parent_of",
            Self::ChildOf => "child_of",
        }
    }

    /// Whether the operator carries a negative semantic.
    #[must_use]
    pub const fn negative(self) -> bool {
        matches!(
            self,
            Self::Ne
                | Self::NotIn
                | Self::NotLike
                | Self::NotIlike
                | Self::NotEqLike
                | Self::NotEqIlike
                | Self::NotAny
        )
    }

    /// Positive counterpart of a negative operator; identity otherwise.
    #[must_use]
    pub const fn positive(self) -> Self {
        match self {
            Self::Ne => Self::Eq,
            Self::NotIn => Self::In,
            Self::NotLike => Self::Like,
            Self::NotIlike => Self::Ilike,
            Self::NotEqLike => Self::EqLike,
            Self::NotEqIlike => Self::EqIlike,
            Self::NotAny => Self::Any,
            other => other,
        }
    }

    /// Involutive negation, defined for the operators whose inverse does not
    /// depend on NULL semantics. Inequalities are deliberately excluded; see
    /// [`Self::inequality_inverse`].
    #[must_use]
    pub const fn negated(self) -> Option<Self> {
        match self {
            Self::Eq => Some(Self::Ne),
            Self::Ne => Some(Self::Eq),
            Self::In => Some(Self::NotIn),
            Self::NotIn => Some(Self::In),
            Self::Like => Some(Self::NotLike),
            Self::NotLike => Some(Self::Like),
            Self::Ilike => Some(Self::NotIlike),
            Self::NotIlike => Some(Self::Ilike),
            Self::EqLike => Some(Self::NotEqLike),
            Self::NotEqLike => Some(Self::EqLike),
            Self::EqIlike => Some(Self::NotEqIlike),
            Self::NotEqIlike => Some(Self::EqIlike),
            Self::Any => Some(Self::NotAny),
            Self::NotAny => Some(Self::Any),
            _ => None,
        }
    }

    /// Inverse of an inequality. Kept separate from [`Self::negated`]
    /// because negating an inequality on a nullable column must also account
    /// for the not-set case.
    #[must_use]
    pub const fn inequality_inverse(self) -> Option<Self> {
        match self {
            Self::Lt => Some(Self::Ge),
            Self::Gt => Some(Self::Le),
            Self::Le => Some(Self::Gt),
            Self::Ge => Some(Self::Lt),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_inequality(self) -> bool {
        matches!(self, Self::Lt | Self::Gt | Self::Le | Self::Ge)
    }

    #[must_use]
    pub const fn like_family(self) -> bool {
        matches!(
            self,
            Self::Like
                | Self::NotLike
                | Self::Ilike
                | Self::NotIlike
                | Self::EqLike
                | Self::NotEqLike
                | Self::EqIlike
                | Self::NotEqIlike
        )
    }

    /// Like operators matching the exact pattern (no implied wildcards).
    #[must_use]
    pub const fn exact_like(self) -> bool {
        matches!(
            self,
            Self::EqLike | Self::NotEqLike | Self::EqIlike | Self::NotEqIlike
        )
    }

    /// Operators allowed in a fully optimized domain.
    #[must_use]
    pub const fn standard(self) -> bool {
        matches!(
            self,
            Self::In | Self::NotIn | Self::Any | Self::NotAny
        ) || self.is_inequality()
            || self.like_family()
    }

    /// Bucket used by the canonical child sort so mergeable conditions end
    /// up adjacent: `in`-like first, then `any`-like, then `like`-like, then
    /// everything else by its positive form.
    #[must_use]
    pub const fn sort_class(self) -> &'static str {
        match self.positive() {
            Self::In | Self::Eq | Self::EqIfSet => "0in",
            Self::Any => "1any",
            Self::Like | Self::Ilike | Self::EqLike | Self::EqIlike => "like",
            op => op.as_str(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = OperatorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            "==" => {
                log::warn!("operator '==' is deprecated, use '='");
                Self::Eq
            }
            "<>" => {
                log::warn!("operator '<>' is deprecated, use '!='");
                Self::Ne
            }
            "<" => Self::Lt,
            ">" => Self::Gt,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "in" => Self::In,
            "not in" => Self::NotIn,
            "like" => Self::Like,
            "not like" => Self::NotLike,
            "ilike" => Self::Ilike,
            "not ilike" => Self::NotIlike,
            "=like" => Self::EqLike,
            "not =like" => Self::NotEqLike,
            "=ilike" => Self::EqIlike,
            "not =ilike" => Self::NotEqIlike,
            "any" => Self::Any,
            "not any" => Self::NotAny,
            "=?" => Self::EqIfSet,
            "parent_of" => Self::ParentOf,
            "child_of" => Self::ChildOf,
            other => return Err(OperatorParseError(other.to_string())),
        };
        Ok(op)
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

///
/// TESTS
///
