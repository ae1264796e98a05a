//! Expression and predicate capabilities consumed by the processors.
//!
//! Languages are registered by name on the engine. `jq` filters see the
//! exchange as `{id, body, headers, properties, exception}`.

use crate::exchange::{is_truthy, Exchange, ExchangeError};
use jaq_interpret::{
    Ctx as JaqCtx, Filter as JaqFilter, FilterT, ParseCtx as JaqParseCtx, RcIter as JaqRcIter,
    Val as JaqVal,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_LANGUAGE: &str = "jq";

pub trait Expression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Result<JsonValue, ExchangeError>;

    /// Source text used in diagnostics.
    fn describe(&self) -> String {
        "<expression>".to_string()
    }
}

pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> Result<bool, ExchangeError>;

    fn describe(&self) -> String {
        "<predicate>".to_string()
    }
}

pub type SharedExpression = Arc<dyn Expression>;
pub type SharedPredicate = Arc<dyn Predicate>;

impl fmt::Debug for dyn Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expression({})", self.describe())
    }
}

impl fmt::Debug for dyn Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.describe())
    }
}

pub trait Language: Send + Sync {
    fn name(&self) -> &str;

    /// Compiles `text`; the error is a human readable reason.
    fn create_expression(&self, text: &str) -> Result<SharedExpression, String>;

    fn create_predicate(&self, text: &str) -> Result<SharedPredicate, String> {
        let expression = self.create_expression(text)?;
        Ok(Arc::new(ExpressionPredicate { expression }))
    }
}

/// Predicate over an expression result using JSON truthiness.
pub struct ExpressionPredicate {
    expression: SharedExpression,
}

impl ExpressionPredicate {
    pub fn new(expression: SharedExpression) -> Self {
        Self { expression }
    }
}

impl Predicate for ExpressionPredicate {
    fn matches(&self, exchange: &Exchange) -> Result<bool, ExchangeError> {
        self.expression.evaluate(exchange).map(|value| is_truthy(&value))
    }

    fn describe(&self) -> String {
        self.expression.describe()
    }
}

struct FnExpression<F> {
    f: F,
}

impl<F> Expression for FnExpression<F>
where
    F: Fn(&Exchange) -> Result<JsonValue, ExchangeError> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Result<JsonValue, ExchangeError> {
        (self.f)(exchange)
    }
}

struct FnPredicate<F> {
    f: F,
}

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> Result<bool, ExchangeError> {
        Ok((self.f)(exchange))
    }
}

pub fn expression_fn<F>(f: F) -> SharedExpression
where
    F: Fn(&Exchange) -> Result<JsonValue, ExchangeError> + Send + Sync + 'static,
{
    Arc::new(FnExpression { f })
}

pub fn predicate_fn<F>(f: F) -> SharedPredicate
where
    F: Fn(&Exchange) -> bool + Send + Sync + 'static,
{
    Arc::new(FnPredicate { f })
}

pub fn constant(value: impl Into<JsonValue>) -> SharedExpression {
    Arc::new(ConstantExpression {
        value: value.into(),
    })
}

pub struct JqLanguage;

impl Language for JqLanguage {
    fn name(&self) -> &str {
        "jq"
    }

    fn create_expression(&self, text: &str) -> Result<SharedExpression, String> {
        let canonical = text.trim().to_string();
        compile_jq(&canonical)?;
        Ok(Arc::new(JqExpression { canonical }))
    }
}

struct JqExpression {
    canonical: String,
}

fn compile_jq(canonical: &str) -> Result<JaqFilter, String> {
    let (parsed, parse_errors) = jaq_parse::parse(canonical, jaq_parse::main());
    if !parse_errors.is_empty() {
        return Err(parse_errors
            .into_iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; "));
    }
    let main = parsed.ok_or_else(|| "expression did not produce a filter".to_string())?;

    let mut ctx = JaqParseCtx::new(Vec::new());
    ctx.insert_natives(jaq_core::core());
    ctx.insert_defs(jaq_std::std());
    let filter = ctx.compile(main);
    if !ctx.errs.is_empty() {
        return Err("failed to compile expression".to_string());
    }
    Ok(filter)
}

impl Expression for JqExpression {
    /// An empty result stream evaluates to `null`; several results are
    /// collected into an array.
    fn evaluate(&self, exchange: &Exchange) -> Result<JsonValue, ExchangeError> {
        let filter = compile_jq(&self.canonical)
            .map_err(|reason| ExchangeError::expression(&self.canonical, reason))?;

        let inputs = JaqRcIter::new(std::iter::empty::<Result<JaqVal, String>>());
        let input = JaqVal::from(exchange.to_json());
        let mut values = Vec::new();
        for result in filter.run((JaqCtx::new([], &inputs), input)) {
            let value = result
                .map_err(|err| ExchangeError::expression(&self.canonical, err.to_string()))?;
            values.push(JsonValue::from(value));
        }

        Ok(match values.len() {
            0 => JsonValue::Null,
            1 => values.pop().unwrap_or(JsonValue::Null),
            _ => JsonValue::Array(values),
        })
    }

    fn describe(&self) -> String {
        self.canonical.clone()
    }
}

/// Text that parses as JSON yields that value, anything else yields the text.
pub struct ConstantLanguage;

impl Language for ConstantLanguage {
    fn name(&self) -> &str {
        "constant"
    }

    fn create_expression(&self, text: &str) -> Result<SharedExpression, String> {
        let value = serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()));
        Ok(constant(value))
    }
}

struct ConstantExpression {
    value: JsonValue,
}

impl Expression for ConstantExpression {
    fn evaluate(&self, _exchange: &Exchange) -> Result<JsonValue, ExchangeError> {
        Ok(self.value.clone())
    }

    fn describe(&self) -> String {
        self.value.to_string()
    }
}

pub struct HeaderLanguage;

impl Language for HeaderLanguage {
    fn name(&self) -> &str {
        "header"
    }

    fn create_expression(&self, text: &str) -> Result<SharedExpression, String> {
        let name = non_empty_name(text, "header")?;
        Ok(Arc::new(LookupExpression {
            name,
            source: LookupSource::Header,
        }))
    }
}

pub struct PropertyLanguage;

impl Language for PropertyLanguage {
    fn name(&self) -> &str {
        "property"
    }

    fn create_expression(&self, text: &str) -> Result<SharedExpression, String> {
        let name = non_empty_name(text, "property")?;
        Ok(Arc::new(LookupExpression {
            name,
            source: LookupSource::Property,
        }))
    }
}

fn non_empty_name(text: &str, what: &str) -> Result<String, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(format!("{what} name must not be empty"));
    }
    Ok(trimmed.to_string())
}

enum LookupSource {
    Header,
    Property,
}

struct LookupExpression {
    name: String,
    source: LookupSource,
}

impl Expression for LookupExpression {
    fn evaluate(&self, exchange: &Exchange) -> Result<JsonValue, ExchangeError> {
        let value = match self.source {
            LookupSource::Header => exchange.header(&self.name),
            LookupSource::Property => exchange.property(&self.name),
        };
        Ok(value.cloned().unwrap_or(JsonValue::Null))
    }

    fn describe(&self) -> String {
        match self.source {
            LookupSource::Header => format!("header:{}", self.name),
            LookupSource::Property => format!("property:{}", self.name),
        }
    }
}

/// Languages available to route definitions, keyed by name.
#[derive(Clone)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<dyn Language>>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        let mut registry = Self {
            languages: HashMap::new(),
        };
        registry.register(Arc::new(JqLanguage));
        registry.register(Arc::new(ConstantLanguage));
        registry.register(Arc::new(HeaderLanguage));
        registry.register(Arc::new(PropertyLanguage));
        registry
    }
}

impl LanguageRegistry {
    pub fn register(&mut self, language: Arc<dyn Language>) {
        self.languages.insert(language.name().to_string(), language);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Language>> {
        self.languages.get(name).cloned()
    }
}
