//! Named-parameter template compilation.
//!
//! Templates use `:name` placeholders. Compilation replaces each one with a
//! positional `?` and records the names in order. Quoted literals are copied
//! verbatim, and a `::` cast is never mistaken for a placeholder.

use std::sync::Arc;

use dashmap::DashMap;

/// A template compiled to positional form. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    pub text: String,
    /// One entry per `?` in `text`, left to right. Names may repeat.
    pub param_names: Vec<String>,
}

impl CompiledStatement {
    /// Compiles `template`, then prefixes every occurrence of `table_name`.
    ///
    /// An unterminated quote leaves the rest of the template quoted.
    #[must_use]
    pub fn compile(template: &str, table_name: &str, table_prefix: &str) -> Self {
        let mut text = String::with_capacity(template.len());
        let mut param_names = vec![];

        let mut in_single_quote = false;
        let mut in_double_quote = false;
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if in_single_quote {
                in_single_quote = c != '\'';
            } else if in_double_quote {
                in_double_quote = c != '"';
            } else if c == '\'' {
                in_single_quote = true;
            } else if c == '"' {
                in_double_quote = true;
            } else if c == ':'
                && chars.peek().is_some_and(|x| is_identifier_start(*x))
                && !text.ends_with(':')
            {
                let mut name = String::new();
                while let Some(x) = chars.next_if(|x| is_identifier_part(*x)) {
                    name.push(x);
                }
                param_names.push(name);
                text.push('?');
                continue;
            }
            text.push(c);
        }

        if !table_prefix.is_empty() && !table_name.is_empty() {
            text = text.replace(table_name, &format!("{table_prefix}{table_name}"));
        }

        Self { text, param_names }
    }
}

const fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_identifier_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Process-lifetime cache of compiled templates.
///
/// Keyed by table name and exact template text. Owned by one
/// [`SqlEngine`](crate::SqlEngine), so the table prefix is fixed for every
/// entry and is not part of the key. Lookups of unrelated
/// templates never block each other, and a compilation race on a new
/// template keeps the first entry stored.
#[derive(Debug, Default)]
pub struct StatementCache {
    entries: DashMap<(String, String), Arc<CompiledStatement>>,
}

impl StatementCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_or_compile(
        &self,
        template: &str,
        table_name: &str,
        table_prefix: &str,
    ) -> Arc<CompiledStatement> {
        let key = (table_name.to_string(), template.to_string());
        if let Some(entry) = self.entries.get(&key) {
            return entry.value().clone();
        }

        let compiled = Arc::new(CompiledStatement::compile(template, table_name, table_prefix));
        log::trace!(
            "compiled statement: {} params={:?}",
            compiled.text,
            compiled.param_names
        );

        self.entries
            .entry(key)
            .or_insert(compiled)
            .value()
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
