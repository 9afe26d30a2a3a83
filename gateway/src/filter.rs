use std::fmt;

/// Query-string predicate in the data service's filter grammar
/// (`column=op.value`, joined with `&`).
///
/// Operand values are percent-encoded so caller-provided ids cannot smuggle
/// extra predicates into the query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    parts: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the returned columns.
    pub fn select(mut self, columns: &str) -> Self {
        self.parts.push(format!("select={columns}"));
        self
    }

    pub fn eq(self, column: &str, value: impl fmt::Display) -> Self {
        self.op(column, "eq", value)
    }

    pub fn gt(self, column: &str, value: impl fmt::Display) -> Self {
        self.op(column, "gt", value)
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.parts.push(format!("{column}=is.null"));
        self
    }

    /// Append every predicate of `other`.
    pub fn and(mut self, other: Filter) -> Self {
        self.parts.extend(other.parts);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn op(mut self, column: &str, op: &str, value: impl fmt::Display) -> Self {
        let encoded: String =
            url::form_urlencoded::byte_serialize(value.to_string().as_bytes()).collect();
        self.parts.push(format!("{column}={op}.{encoded}"));
        self
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join("&"))
    }
}
