//! Expression AST
//!
//! Expressions are immutable trees over a single typed argument. Two trees
//! are equal when they are structurally equal, which makes expressions
//! usable as cache keys for shared live statements.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{ExpressionError, ExpressionResult};

/// Static type of an expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Integer,
    Float,
    String,
    /// Instance of a registered entity type
    Entity { entity: String },
    /// Homogeneous collection
    List { element: Box<ValueType> },
    /// Untyped; accepted wherever a concrete type is expected
    Any,
}

impl ValueType {
    pub fn entity(name: impl Into<String>) -> Self {
        ValueType::Entity {
            entity: name.into(),
        }
    }

    pub fn list(element: ValueType) -> Self {
        ValueType::List {
            element: Box::new(element),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Float | ValueType::Any)
    }

    /// Scalars with a total order
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            ValueType::Boolean
                | ValueType::Integer
                | ValueType::Float
                | ValueType::String
                | ValueType::Any
        )
    }

    pub fn is_any(&self) -> bool {
        matches!(self, ValueType::Any)
    }

    /// Name of the entity type, if this is one
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            ValueType::Entity { entity } => Some(entity),
            _ => None,
        }
    }

    /// Element type, if this is a list
    pub fn element(&self) -> Option<&ValueType> {
        match self {
            ValueType::List { element } => Some(element),
            _ => None,
        }
    }

    /// Two types can meet in an equality, an ordering or a composition
    pub fn is_compatible(&self, other: &ValueType) -> bool {
        match (self, other) {
            (ValueType::Any, _) | (_, ValueType::Any) => true,
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            (ValueType::List { element: a }, ValueType::List { element: b }) => {
                a.is_compatible(b)
            }
            (a, b) => a == b,
        }
    }

    /// Result type of arithmetic over two numeric operands
    fn widen(&self, other: &ValueType) -> ValueType {
        match (self, other) {
            (ValueType::Integer, ValueType::Integer) => ValueType::Integer,
            (ValueType::Any, _) | (_, ValueType::Any) => ValueType::Any,
            _ => ValueType::Float,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Boolean => write!(f, "boolean"),
            ValueType::Integer => write!(f, "integer"),
            ValueType::Float => write!(f, "float"),
            ValueType::String => write!(f, "string"),
            ValueType::Entity { entity } => write!(f, "entity {}", entity),
            ValueType::List { element } => write!(f, "list<{}>", element),
            ValueType::Any => write!(f, "any"),
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Negate,
    IsNull,
    IsNotNull,
    AsString,
    Length,
    IsEmpty,
    ToLower,
    ToUpper,
    Trim,
    /// Number of elements in a list
    Count,
    /// Some element of a boolean list is true
    Any,
    /// Every element of a boolean list is true
    All,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Negate => "-",
            UnaryOp::IsNull => "is_null",
            UnaryOp::IsNotNull => "is_not_null",
            UnaryOp::AsString => "as_string",
            UnaryOp::Length => "length",
            UnaryOp::IsEmpty => "is_empty",
            UnaryOp::ToLower => "to_lower",
            UnaryOp::ToUpper => "to_upper",
            UnaryOp::Trim => "trim",
            UnaryOp::Count => "count",
            UnaryOp::Any => "any",
            UnaryOp::All => "all",
        }
    }

    fn result_type(&self, operand: &ValueType) -> ValueType {
        match self {
            UnaryOp::Not
            | UnaryOp::IsNull
            | UnaryOp::IsNotNull
            | UnaryOp::IsEmpty
            | UnaryOp::Any
            | UnaryOp::All => ValueType::Boolean,
            UnaryOp::Negate => operand.clone(),
            UnaryOp::AsString | UnaryOp::ToLower | UnaryOp::ToUpper | UnaryOp::Trim => {
                ValueType::String
            }
            UnaryOp::Length | UnaryOp::Count => ValueType::Integer,
        }
    }

    fn check(&self, operand: &ValueType) -> ExpressionResult<()> {
        let ok = match self {
            UnaryOp::Not => matches!(operand, ValueType::Boolean | ValueType::Any),
            UnaryOp::Negate => operand.is_numeric(),
            UnaryOp::IsNull | UnaryOp::IsNotNull | UnaryOp::AsString => true,
            UnaryOp::Length | UnaryOp::ToLower | UnaryOp::ToUpper | UnaryOp::Trim => {
                matches!(operand, ValueType::String | ValueType::Any)
            }
            UnaryOp::IsEmpty => matches!(
                operand,
                ValueType::String | ValueType::List { .. } | ValueType::Any
            ),
            UnaryOp::Count => matches!(operand, ValueType::List { .. } | ValueType::Any),
            UnaryOp::Any | UnaryOp::All => match operand {
                ValueType::List { element } => {
                    matches!(**element, ValueType::Boolean | ValueType::Any)
                }
                ValueType::Any => true,
                _ => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(ExpressionError::mismatch(
                self.symbol(),
                self.expected(),
                operand,
            ))
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            UnaryOp::Not => "boolean",
            UnaryOp::Negate => "numeric",
            UnaryOp::Length | UnaryOp::ToLower | UnaryOp::ToUpper | UnaryOp::Trim => "string",
            UnaryOp::IsEmpty => "string or list",
            UnaryOp::Count => "list",
            UnaryOp::Any | UnaryOp::All => "list<boolean>",
            UnaryOp::IsNull | UnaryOp::IsNotNull | UnaryOp::AsString => "any",
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    And,
    Or,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Concat,
    /// Left operand is an element of the right list
    In,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Equals => "==",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Contains => "contains",
            BinaryOp::StartsWith => "starts_with",
            BinaryOp::EndsWith => "ends_with",
            BinaryOp::Matches => "matches",
            BinaryOp::Concat => "++",
            BinaryOp::In => "in",
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide
        )
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            BinaryOp::GreaterThan
                | BinaryOp::GreaterOrEqual
                | BinaryOp::LessThan
                | BinaryOp::LessOrEqual
        )
    }

    fn result_type(&self, left: &ValueType, right: &ValueType) -> ValueType {
        if self.is_arithmetic() {
            left.widen(right)
        } else if *self == BinaryOp::Concat {
            ValueType::String
        } else {
            ValueType::Boolean
        }
    }

    fn check(&self, left: &ValueType, right: &ValueType) -> ExpressionResult<()> {
        let context = self.symbol();
        let is_string = |t: &ValueType| matches!(t, ValueType::String | ValueType::Any);
        let is_bool = |t: &ValueType| matches!(t, ValueType::Boolean | ValueType::Any);

        match self {
            op if op.is_arithmetic() => {
                if !left.is_numeric() {
                    return Err(ExpressionError::mismatch(context, "numeric", left));
                }
                if !right.is_numeric() {
                    return Err(ExpressionError::mismatch(context, "numeric", right));
                }
            }
            BinaryOp::Equals => {
                if !left.is_compatible(right) {
                    return Err(ExpressionError::mismatch(context, left.to_string(), right));
                }
            }
            op if op.is_ordering() => {
                if !left.is_comparable() {
                    return Err(ExpressionError::NotComparable(left.to_string()));
                }
                if !right.is_comparable() {
                    return Err(ExpressionError::NotComparable(right.to_string()));
                }
                if !left.is_compatible(right) {
                    return Err(ExpressionError::mismatch(context, left.to_string(), right));
                }
            }
            BinaryOp::And | BinaryOp::Or => {
                if !is_bool(left) {
                    return Err(ExpressionError::mismatch(context, "boolean", left));
                }
                if !is_bool(right) {
                    return Err(ExpressionError::mismatch(context, "boolean", right));
                }
            }
            BinaryOp::Contains => match left {
                ValueType::List { element } => {
                    if !element.is_compatible(right) {
                        return Err(ExpressionError::mismatch(
                            context,
                            element.to_string(),
                            right,
                        ));
                    }
                }
                l if is_string(l) => {
                    if !is_string(right) {
                        return Err(ExpressionError::mismatch(context, "string", right));
                    }
                }
                l => return Err(ExpressionError::mismatch(context, "string or list", l)),
            },
            BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Matches | BinaryOp::Concat => {
                if !is_string(left) {
                    return Err(ExpressionError::mismatch(context, "string", left));
                }
                if !is_string(right) {
                    return Err(ExpressionError::mismatch(context, "string", right));
                }
            }
            BinaryOp::In => match right {
                ValueType::List { element } => {
                    if !element.is_compatible(left) {
                        return Err(ExpressionError::mismatch(
                            context,
                            element.to_string(),
                            left,
                        ));
                    }
                }
                ValueType::Any => {}
                r => return Err(ExpressionError::mismatch(context, "list", r)),
            },
            _ => {}
        }
        Ok(())
    }
}

/// Expression tree
///
/// Every tree has at most one argument type. `Composed` opens a new scope:
/// its `inner` expression is evaluated per element of the list produced by
/// `outer`, so arguments inside `inner` refer to the element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expression {
    /// The value the expression is applied to
    Argument { value_type: ValueType },
    /// Literal value; `null` is the absent value
    Constant { value: Value, value_type: ValueType },
    /// Member access on an entity-typed source
    Property {
        source: Box<Expression>,
        name: String,
        value_type: ValueType,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Conditional {
        test: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    /// `inner` mapped over each element of the list `outer`
    Composed {
        outer: Box<Expression>,
        inner: Box<Expression>,
    },
}

impl Expression {
    // ==================
    // Leaves
    // ==================

    pub fn argument(value_type: ValueType) -> Self {
        Expression::Argument { value_type }
    }

    /// Argument of an entity type
    pub fn entity(name: impl Into<String>) -> Self {
        Expression::argument(ValueType::entity(name))
    }

    /// Constant with its type inferred from the value
    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        let value_type = infer_type(&value);
        Expression::Constant { value, value_type }
    }

    pub fn typed_constant(value: Value, value_type: ValueType) -> Self {
        Expression::Constant { value, value_type }
    }

    /// Absent value of the given type
    pub fn null(value_type: ValueType) -> Self {
        Expression::Constant {
            value: Value::Null,
            value_type,
        }
    }

    /// Member access; the source must be entity-typed
    pub fn property(self, name: impl Into<String>, value_type: ValueType) -> Self {
        Expression::Property {
            source: Box::new(self),
            name: name.into(),
            value_type,
        }
    }

    pub(crate) fn unary(self, op: UnaryOp) -> Self {
        Expression::Unary {
            op,
            operand: Box::new(self),
        }
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    // ==================
    // Comparisons
    // ==================

    pub fn equal_to(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::Equals, self, other.into())
    }

    pub fn not_equal_to(self, other: impl Into<Expression>) -> Self {
        self.equal_to(other).unary(UnaryOp::Not)
    }

    pub fn greater_than(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::GreaterThan, self, other.into())
    }

    pub fn greater_or_equal(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::GreaterOrEqual, self, other.into())
    }

    pub fn less_than(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::LessThan, self, other.into())
    }

    pub fn less_or_equal(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::LessOrEqual, self, other.into())
    }

    /// Inclusive range
    pub fn between(self, min: impl Into<Expression>, max: impl Into<Expression>) -> Self {
        self.clone()
            .greater_or_equal(min)
            .and(self.less_or_equal(max))
    }

    /// Exclusive range
    pub fn between_exclusive(self, min: impl Into<Expression>, max: impl Into<Expression>) -> Self {
        self.clone().greater_than(min).and(self.less_than(max))
    }

    pub fn is_in(self, list: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::In, self, list.into())
    }

    pub fn is_null(self) -> Self {
        self.unary(UnaryOp::IsNull)
    }

    pub fn is_not_null(self) -> Self {
        self.unary(UnaryOp::IsNotNull)
    }

    // ==================
    // Logic
    // ==================

    pub fn and(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::And, self, other.into())
    }

    pub fn or(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::Or, self, other.into())
    }

    /// `if self then then_value else otherwise`
    pub fn when(self, then_value: impl Into<Expression>, otherwise: impl Into<Expression>) -> Self {
        Expression::Conditional {
            test: Box::new(self),
            then: Box::new(then_value.into()),
            otherwise: Box::new(otherwise.into()),
        }
    }

    // ==================
    // Strings
    // ==================

    pub fn as_string(self) -> Self {
        self.unary(UnaryOp::AsString)
    }

    pub fn length(self) -> Self {
        self.unary(UnaryOp::Length)
    }

    pub fn is_empty(self) -> Self {
        self.unary(UnaryOp::IsEmpty)
    }

    pub fn to_lower(self) -> Self {
        self.unary(UnaryOp::ToLower)
    }

    pub fn to_upper(self) -> Self {
        self.unary(UnaryOp::ToUpper)
    }

    pub fn trim(self) -> Self {
        self.unary(UnaryOp::Trim)
    }

    pub fn contains(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::Contains, self, other.into())
    }

    pub fn starts_with(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::StartsWith, self, other.into())
    }

    pub fn ends_with(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::EndsWith, self, other.into())
    }

    pub fn matches(self, pattern: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::Matches, self, pattern.into())
    }

    pub fn concat(self, other: impl Into<Expression>) -> Self {
        Expression::binary(BinaryOp::Concat, self, other.into())
    }

    // ==================
    // Collections
    // ==================

    pub fn count(self) -> Self {
        self.unary(UnaryOp::Count)
    }

    pub fn any(self) -> Self {
        self.unary(UnaryOp::Any)
    }

    pub fn all(self) -> Self {
        self.unary(UnaryOp::All)
    }

    // ==================
    // Typing
    // ==================

    /// Static result type
    pub fn value_type(&self) -> ValueType {
        match self {
            Expression::Argument { value_type }
            | Expression::Constant { value_type, .. }
            | Expression::Property { value_type, .. } => value_type.clone(),
            Expression::Unary { op, operand } => op.result_type(&operand.value_type()),
            Expression::Binary { op, left, right } => {
                op.result_type(&left.value_type(), &right.value_type())
            }
            Expression::Conditional { then, .. } => then.value_type(),
            Expression::Composed { inner, .. } => ValueType::list(inner.value_type()),
        }
    }

    /// Type-check the whole tree and return its result type
    pub fn validate(&self) -> ExpressionResult<ValueType> {
        match self {
            Expression::Argument { value_type } | Expression::Constant { value_type, .. } => {
                Ok(value_type.clone())
            }
            Expression::Property {
                source,
                name,
                value_type,
            } => {
                let source_type = source.validate()?;
                match source_type {
                    ValueType::Entity { .. } | ValueType::Any => Ok(value_type.clone()),
                    other => Err(ExpressionError::mismatch(
                        format!("property '{}'", name),
                        "entity",
                        other,
                    )),
                }
            }
            Expression::Unary { op, operand } => {
                let operand_type = operand.validate()?;
                op.check(&operand_type)?;
                Ok(op.result_type(&operand_type))
            }
            Expression::Binary { op, left, right } => {
                let left_type = left.validate()?;
                let right_type = right.validate()?;
                op.check(&left_type, &right_type)?;
                Ok(op.result_type(&left_type, &right_type))
            }
            Expression::Conditional {
                test,
                then,
                otherwise,
            } => {
                let test_type = test.validate()?;
                if !matches!(test_type, ValueType::Boolean | ValueType::Any) {
                    return Err(ExpressionError::mismatch("condition", "boolean", test_type));
                }
                let then_type = then.validate()?;
                let otherwise_type = otherwise.validate()?;
                if !then_type.is_compatible(&otherwise_type) {
                    return Err(ExpressionError::mismatch(
                        "conditional branches",
                        then_type.to_string(),
                        otherwise_type,
                    ));
                }
                Ok(then_type)
            }
            Expression::Composed { outer, inner } => {
                let outer_type = outer.validate()?;
                let element = match &outer_type {
                    ValueType::List { element } => (**element).clone(),
                    ValueType::Any => ValueType::Any,
                    other => {
                        return Err(ExpressionError::mismatch("composition", "list", other));
                    }
                };
                if let Some(arg) = inner.argument_type()? {
                    if !arg.is_compatible(&element) {
                        return Err(ExpressionError::mismatch(
                            "composition",
                            arg.to_string(),
                            element,
                        ));
                    }
                }
                Ok(ValueType::list(inner.validate()?))
            }
        }
    }

    /// Validate as a predicate: the tree must produce a boolean
    pub fn validate_predicate(&self) -> ExpressionResult<()> {
        match self.validate()? {
            ValueType::Boolean | ValueType::Any => Ok(()),
            other => Err(ExpressionError::mismatch("predicate", "boolean", other)),
        }
    }

    /// Argument type of this scope, or `None` for a closed expression.
    ///
    /// Arguments inside a `Composed` inner belong to the element scope and
    /// are not visited. Conflicting argument types are a composition error.
    pub fn argument_type(&self) -> ExpressionResult<Option<ValueType>> {
        let mut found: Option<ValueType> = None;
        let mut conflict = None;
        self.visit_scope(&mut |node| {
            if let Expression::Argument { value_type } = node {
                match &found {
                    None => found = Some(value_type.clone()),
                    Some(existing) if existing != value_type => {
                        conflict = Some((existing.clone(), value_type.clone()));
                    }
                    Some(_) => {}
                }
            }
        });
        match conflict {
            Some((a, b)) => Err(ExpressionError::InvalidComposition(format!(
                "expression mixes arguments of type {} and {}",
                a, b
            ))),
            None => Ok(found),
        }
    }

    /// Visit every node of the current argument scope, pre-order
    pub(crate) fn visit_scope<F: FnMut(&Expression)>(&self, f: &mut F) {
        f(self);
        match self {
            Expression::Argument { .. } | Expression::Constant { .. } => {}
            Expression::Property { source, .. } => source.visit_scope(f),
            Expression::Unary { operand, .. } => operand.visit_scope(f),
            Expression::Binary { left, right, .. } => {
                left.visit_scope(f);
                right.visit_scope(f);
            }
            Expression::Conditional {
                test,
                then,
                otherwise,
            } => {
                test.visit_scope(f);
                then.visit_scope(f);
                otherwise.visit_scope(f);
            }
            Expression::Composed { outer, .. } => outer.visit_scope(f),
        }
    }

    /// Dotted path of a property chain rooted at the argument
    pub fn property_path(&self) -> Option<String> {
        match self {
            Expression::Property { source, name, .. } => match source.as_ref() {
                Expression::Argument { .. } => Some(name.clone()),
                inner => inner.property_path().map(|p| format!("{}.{}", p, name)),
            },
            _ => None,
        }
    }

    /// Maximal property chains referenced in this scope
    pub fn referenced_properties(&self) -> Vec<Expression> {
        let mut out = Vec::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties(&self, out: &mut Vec<Expression>) {
        match self {
            Expression::Property { .. } if self.property_path().is_some() => {
                if !out.contains(self) {
                    out.push(self.clone());
                }
            }
            Expression::Argument { .. } | Expression::Constant { .. } => {}
            Expression::Property { source, .. } => source.collect_properties(out),
            Expression::Unary { operand, .. } => operand.collect_properties(out),
            Expression::Binary { left, right, .. } => {
                left.collect_properties(out);
                right.collect_properties(out);
            }
            Expression::Conditional {
                test,
                then,
                otherwise,
            } => {
                test.collect_properties(out);
                then.collect_properties(out);
                otherwise.collect_properties(out);
            }
            Expression::Composed { outer, .. } => outer.collect_properties(out),
        }
    }
}

/// Type of a literal
pub(crate) fn infer_type(value: &Value) -> ValueType {
    match value {
        Value::Bool(_) => ValueType::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => ValueType::Integer,
        Value::Number(_) => ValueType::Float,
        Value::String(_) => ValueType::String,
        Value::Array(items) => {
            let mut element: Option<ValueType> = None;
            for item in items.iter().filter(|v| !v.is_null()) {
                let t = infer_type(item);
                element = match element {
                    None => Some(t),
                    Some(e) if e == t => Some(e),
                    Some(e) if e.is_numeric() && t.is_numeric() => Some(ValueType::Float),
                    Some(_) => Some(ValueType::Any),
                };
            }
            ValueType::list(element.unwrap_or(ValueType::Any))
        }
        Value::Null | Value::Object(_) => ValueType::Any,
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Argument { .. } => write!(f, "$"),
            Expression::Constant { value, .. } => write!(f, "{}", value),
            Expression::Property { source, name, .. } => write!(f, "{}.{}", source, name),
            Expression::Unary { op, operand } => match op {
                UnaryOp::Negate => write!(f, "-{}", operand),
                _ => write!(f, "{}({})", op.symbol(), operand),
            },
            Expression::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expression::Conditional {
                test,
                then,
                otherwise,
            } => write!(f, "(if {} then {} else {})", test, then, otherwise),
            Expression::Composed { outer, inner } => write!(f, "{}[* => {}]", outer, inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Expression {
        Expression::entity("Product")
    }

    #[test]
    fn test_structural_equality() {
        let a = product().property("number", ValueType::Integer).less_than(5);
        let b = product().property("number", ValueType::Integer).less_than(5);
        let c = product().property("number", ValueType::Integer).less_than(6);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_not_equal_is_negated_equality() {
        let x = product().property("text", ValueType::String);
        let ne = x.clone().not_equal_to("a");
        assert_eq!(
            ne,
            Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(x.equal_to("a")),
            }
        );
    }

    #[test]
    fn test_between_is_inclusive_conjunction() {
        let x = product().property("number", ValueType::Integer);
        let expected = x
            .clone()
            .greater_or_equal(1)
            .and(x.clone().less_or_equal(3));
        assert_eq!(x.between(1, 3), expected);
    }

    #[test]
    fn test_validate_rejects_arithmetic_on_strings() {
        let x = product().property("text", ValueType::String);
        let err = (x + 1).validate().unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_validate_rejects_ordering_on_entity() {
        let vendor = product().property("vendor", ValueType::entity("Vendor"));
        let other = Expression::typed_constant(Value::Null, ValueType::entity("Vendor"));
        let err = vendor.greater_than(other).validate().unwrap_err();
        assert!(matches!(err, ExpressionError::NotComparable(_)));
    }

    #[test]
    fn test_value_type_widening() {
        let n = product().property("number", ValueType::Integer);
        assert_eq!((n.clone() + 1).value_type(), ValueType::Integer);
        assert_eq!((n + 1.5).value_type(), ValueType::Float);
    }

    #[test]
    fn test_argument_type_conflict() {
        let mixed = Expression::entity("Product")
            .property("number", ValueType::Integer)
            .equal_to(Expression::entity("Vendor").property("id", ValueType::Integer));
        assert!(matches!(
            mixed.argument_type(),
            Err(ExpressionError::InvalidComposition(_))
        ));
    }

    #[test]
    fn test_property_path() {
        let id = product()
            .property("vendor", ValueType::entity("Vendor"))
            .property("id", ValueType::Integer);
        assert_eq!(id.property_path().as_deref(), Some("vendor.id"));
    }

    #[test]
    fn test_referenced_properties_are_maximal_chains() {
        let vendor_id = product()
            .property("vendor", ValueType::entity("Vendor"))
            .property("id", ValueType::Integer);
        let number = product().property("number", ValueType::Integer);
        let expr = (number.clone() + vendor_id.clone()).greater_than(number.clone());

        assert_eq!(expr.referenced_properties(), vec![number, vendor_id]);
    }

    #[test]
    fn test_infer_constant_types() {
        assert_eq!(infer_type(&Value::from(3)), ValueType::Integer);
        assert_eq!(infer_type(&Value::from(0.5)), ValueType::Float);
        assert_eq!(
            infer_type(&serde_json::json!([1, 2])),
            ValueType::list(ValueType::Integer)
        );
    }

    #[test]
    fn test_serde_round_trip_preserves_equality() {
        let expr = product()
            .property("text", ValueType::String)
            .to_lower()
            .starts_with("entity");
        let json = serde_json::to_string(&expr).unwrap();
        let back: Expression = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }

    #[test]
    fn test_display() {
        let expr = product().property("number", ValueType::Integer).less_than(5);
        assert_eq!(expr.to_string(), "($.number < 5)");
    }
}
