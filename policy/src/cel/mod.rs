//! CEL programs, request bindings and per-evaluation scope.

pub mod convert;
pub mod image_ref;
pub mod libs;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cel_interpreter::{Context, ExecutionError, FunctionContext, Value};
use cel_parser::{Atom, Expression, Member};
use celgate_protocol::Namespace;

use crate::error::{EvalError, EvalResult};
use crate::matching::Attributes;
use convert::{to_cel, type_name};
use libs::Libraries;

pub const VAR_OBJECT: &str = "object";
pub const VAR_OLD_OBJECT: &str = "oldObject";
pub const VAR_REQUEST: &str = "request";
pub const VAR_NAMESPACE_OBJECT: &str = "namespaceObject";
pub const VAR_VARIABLES: &str = "variables";
pub const VAR_IMAGES: &str = "images";
pub const VAR_IMAGE: &str = "image";
pub const VAR_ATTESTORS: &str = "attestors";
pub const VAR_ATTESTATIONS: &str = "attestations";

/// Accessor that `variables.<name>` is rewritten into. Not a valid CEL
/// identifier, so user expressions cannot call it directly.
const VARIABLE_ACCESSOR: &str = "@variable";

/// Functions registered by `Context::default()`.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "contains",
    "size",
    "has",
    "map",
    "filter",
    "all",
    "max",
    "min",
    "startsWith",
    "endsWith",
    "string",
    "bytes",
    "double",
    "exists",
    "exists_one",
    "int",
    "uint",
    "matches",
    "duration",
    "timestamp",
    "getFullYear",
    "getMonth",
    "getDayOfYear",
    "getDayOfMonth",
    "getDate",
    "getDayOfWeek",
    "getHours",
    "getMinutes",
    "getSeconds",
    "getMilliseconds",
];

/// Macros whose first argument names a loop variable.
const COMPREHENSIONS: &[&str] = &["all", "exists", "exists_one", "map", "filter"];

/// A parsed CEL expression plus what it references.
///
/// `variables.<name>` and `variables['<name>']` are rewritten into accessor
/// calls at compile time, so a variable only runs when evaluation reaches it.
#[derive(Clone)]
pub struct CelExpression {
    source: Arc<str>,
    expression: Arc<Expression>,
    variable_refs: Arc<[String]>,
    identifiers: Arc<[String]>,
    functions: Arc<[String]>,
}

impl CelExpression {
    pub fn compile(source: &str) -> Result<Self, String> {
        let parsed = cel_parser::parse(source).map_err(|e| e.to_string())?;
        let mut refs = References::default();
        let expression = refs.rewrite(parsed);
        Ok(Self {
            source: Arc::from(source),
            expression: Arc::new(expression),
            variable_refs: refs.variables.into(),
            identifiers: refs.identifiers.into(),
            functions: refs.functions.into(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names read through `variables.*`, in order of first appearance.
    pub fn variable_refs(&self) -> &[String] {
        &self.variable_refs
    }

    /// Free top-level identifiers, excluding comprehension loop variables.
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Names of every function or macro called.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }
}

impl fmt::Debug for CelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CelExpression")
            .field("source", &self.source)
            .field("variable_refs", &self.variable_refs)
            .finish()
    }
}

/// A compiled expression with the name it was declared under.
#[derive(Debug, Clone)]
pub struct NamedProgram {
    pub name: String,
    pub expression: CelExpression,
}

#[derive(Default)]
struct References {
    locals: Vec<Arc<String>>,
    variables: Vec<String>,
    identifiers: Vec<String>,
    functions: Vec<String>,
}

impl References {
    fn rewrite(&mut self, expr: Expression) -> Expression {
        match expr {
            Expression::Member(target, member) => {
                if let Some(name) = self.variable_name(&target, &member) {
                    push_unique(&mut self.variables, &name);
                    return Expression::FunctionCall(
                        Box::new(Expression::Ident(Arc::new(VARIABLE_ACCESSOR.to_string()))),
                        None,
                        vec![Expression::Atom(Atom::String(name))],
                    );
                }
                let target = self.boxed(target);
                let member = match *member {
                    Member::Index(index) => Member::Index(self.boxed(index)),
                    Member::Fields(fields) => Member::Fields(
                        fields
                            .into_iter()
                            .map(|(name, value)| (name, self.rewrite(value)))
                            .collect(),
                    ),
                    attribute => attribute,
                };
                Expression::Member(target, Box::new(member))
            }
            Expression::FunctionCall(name, target, args) => {
                let mut binds = false;
                if let Expression::Ident(function) = &*name {
                    push_unique(&mut self.functions, function);
                    binds = COMPREHENSIONS.contains(&function.as_str());
                }
                let target = target.map(|t| self.boxed(t));
                let mut rewritten = Vec::with_capacity(args.len());
                let mut args = args.into_iter();
                let mut bound = false;
                if binds {
                    match args.next() {
                        Some(Expression::Ident(local)) => {
                            self.locals.push(local.clone());
                            rewritten.push(Expression::Ident(local));
                            bound = true;
                        }
                        Some(other) => rewritten.push(self.rewrite(other)),
                        None => {}
                    }
                }
                rewritten.extend(args.map(|arg| self.rewrite(arg)));
                if bound {
                    self.locals.pop();
                }
                Expression::FunctionCall(name, target, rewritten)
            }
            Expression::Ident(name) => {
                if !self.locals.contains(&name) {
                    push_unique(&mut self.identifiers, &name);
                }
                Expression::Ident(name)
            }
            Expression::Arithmetic(left, op, right) => {
                Expression::Arithmetic(self.boxed(left), op, self.boxed(right))
            }
            Expression::Relation(left, op, right) => {
                Expression::Relation(self.boxed(left), op, self.boxed(right))
            }
            Expression::Ternary(cond, left, right) => {
                Expression::Ternary(self.boxed(cond), self.boxed(left), self.boxed(right))
            }
            Expression::Or(left, right) => Expression::Or(self.boxed(left), self.boxed(right)),
            Expression::And(left, right) => Expression::And(self.boxed(left), self.boxed(right)),
            Expression::Unary(op, operand) => Expression::Unary(op, self.boxed(operand)),
            Expression::List(items) => {
                Expression::List(items.into_iter().map(|item| self.rewrite(item)).collect())
            }
            Expression::Map(entries) => Expression::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (self.rewrite(key), self.rewrite(value)))
                    .collect(),
            ),
            atom @ Expression::Atom(_) => atom,
        }
    }

    fn boxed(&mut self, expr: Box<Expression>) -> Box<Expression> {
        Box::new(self.rewrite(*expr))
    }

    /// `variables.<name>` or `variables['<name>']`, unless shadowed.
    fn variable_name(&self, target: &Expression, member: &Member) -> Option<Arc<String>> {
        let Expression::Ident(root) = target else {
            return None;
        };
        if root.as_str() != VAR_VARIABLES || self.locals.contains(root) {
            return None;
        }
        match member {
            Member::Attribute(name) => Some(name.clone()),
            Member::Index(index) => match &**index {
                Expression::Atom(Atom::String(name)) => Some(name.clone()),
                _ => None,
            },
            Member::Fields(_) => None,
        }
    }
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Request-scoped cancellation: an optional deadline plus a shared flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::default(),
        }
    }

    /// Apply `timeout` when no deadline was set by the caller.
    pub fn or_timeout(&self, timeout: Option<Duration>) -> Self {
        match (self.deadline, timeout) {
            (None, Some(timeout)) => Self {
                deadline: Some(Instant::now() + timeout),
                cancelled: self.cancelled.clone(),
            },
            _ => self.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> EvalResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(EvalError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EvalError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// BINDINGS
// =============================================================================

/// Top-level CEL variables of one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: Vec<(&'static str, Value)>,
}

impl Bindings {
    /// Admission bindings: `object`, `oldObject`, `request`, `namespaceObject`.
    pub fn kubernetes(attributes: &Attributes, namespace: Option<&Namespace>) -> Self {
        let object = attributes.object.as_ref().map_or(Value::Null, to_cel);
        let old_object = attributes.old_object.as_ref().map_or(Value::Null, to_cel);
        let namespace_object = namespace.map_or(Value::Null, |ns| to_cel(&ns.to_object()));
        Self {
            values: vec![
                (VAR_OBJECT, object),
                (VAR_OLD_OBJECT, old_object),
                (VAR_REQUEST, to_cel(&request_document(attributes))),
                (VAR_NAMESPACE_OBJECT, namespace_object),
            ],
        }
    }

    /// Payload bindings: only `object`.
    pub fn json(payload: &serde_json::Value) -> Self {
        Self {
            values: vec![(VAR_OBJECT, to_cel(payload))],
        }
    }

    /// Add or replace a binding.
    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: Value) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    fn install(&self, ctx: &mut Context<'static>) {
        for (name, value) in &self.values {
            ctx.add_variable_from_value(*name, value.clone());
        }
    }
}

fn request_document(attributes: &Attributes) -> serde_json::Value {
    serde_json::json!({
        "kind": attributes.kind,
        "resource": attributes.resource,
        "subResource": attributes.sub_resource,
        "name": attributes.name,
        "namespace": attributes.namespace,
        "operation": attributes.operation,
        "userInfo": attributes.user_info,
        "dryRun": attributes.dry_run,
    })
}

// =============================================================================
// SCOPE
// =============================================================================

/// One evaluation's CEL scope: bindings, libraries and memoized variables.
///
/// Variables are resolved lazily through an accessor registered on the root
/// context. Each variable runs at most once. A failed variable is remembered
/// as an error and reported to whichever program trips over it.
pub struct Scope<'a> {
    base: Context<'static>,
    variables: Arc<LazyVariables>,
    cancellation: Cancellation,
    _programs: PhantomData<&'a [NamedProgram]>,
}

impl<'a> Scope<'a> {
    pub fn new(bindings: &Bindings, libraries: &Libraries, variables: &'a [NamedProgram]) -> Self {
        let cancellation = libraries.cancellation().clone();
        let lazy = Arc::new(LazyVariables {
            programs: variables.to_vec(),
            cache: Mutex::new(HashMap::new()),
            cancellation: cancellation.clone(),
        });
        let mut base = Context::default();
        libraries.register(&mut base);
        bindings.install(&mut base);
        let accessor = lazy.clone();
        base.add_function(
            VARIABLE_ACCESSOR,
            move |ftx: &FunctionContext, name: Arc<String>| -> Result<Value, ExecutionError> {
                accessor
                    .resolve(root_of(ftx.ptx), &name)
                    .map_err(|e| ftx.error(e))
            },
        );
        Self {
            base,
            variables: lazy,
            cancellation,
            _programs: PhantomData,
        }
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Run `expression` with `overrides` shadowing the base bindings.
    pub fn execute(
        &self,
        label: &str,
        expression: &CelExpression,
        overrides: &[(&str, Value)],
    ) -> EvalResult<Value> {
        self.cancellation.check()?;
        let mut ctx = self.base.new_inner_scope();
        for (name, value) in overrides {
            ctx.add_variable_from_value(*name, value.clone());
        }
        match ctx.resolve(&expression.expression) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.cancellation.check()?;
                if let Some(variable_error) = self.variables.failure(expression.variable_refs())? {
                    return Err(variable_error);
                }
                Err(EvalError::execution(label, e))
            }
        }
    }

    pub fn execute_bool(
        &self,
        label: &str,
        expression: &CelExpression,
        overrides: &[(&str, Value)],
    ) -> EvalResult<bool> {
        match self.execute(label, expression, overrides)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::UnexpectedType {
                context: label.to_string(),
                expected: "bool",
                got: type_name(&other).to_string(),
            }),
        }
    }

    pub fn execute_string(
        &self,
        label: &str,
        expression: &CelExpression,
        overrides: &[(&str, Value)],
    ) -> EvalResult<String> {
        match self.execute(label, expression, overrides)? {
            Value::String(s) => Ok(s.as_str().to_string()),
            other => Err(EvalError::UnexpectedType {
                context: label.to_string(),
                expected: "string",
                got: type_name(&other).to_string(),
            }),
        }
    }

    /// Resolve one variable, running its program on first use.
    pub fn variable(&self, name: &str) -> EvalResult<Value> {
        self.variables.resolve(&self.base, name)
    }
}

/// Variable programs of one scope and their memoized results.
struct LazyVariables {
    programs: Vec<NamedProgram>,
    cache: Mutex<HashMap<String, EvalResult<Value>>>,
    cancellation: Cancellation,
}

impl LazyVariables {
    /// Variables always run against the root context, never a caller's overrides.
    fn resolve(&self, root: &Context<'_>, name: &str) -> EvalResult<Value> {
        if let Some(cached) = self.cached(name)? {
            return cached;
        }
        let Some(program) = self.programs.iter().find(|v| v.name == name) else {
            return Err(EvalError::Variable {
                name: name.to_string(),
                message: "undeclared variable".to_string(),
            });
        };
        self.cancellation.check()?;
        let result = match root.resolve(&program.expression.expression) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.cancellation.check()?;
                match self.failure(program.expression.variable_refs())? {
                    Some(inner) => Err(inner),
                    None => Err(EvalError::Variable {
                        name: name.to_string(),
                        message: EvalError::execution(format!("variables.{}", name), e).to_string(),
                    }),
                }
            }
        };
        self.cache
            .lock()
            .map_err(|_| EvalError::Prepare("variable cache poisoned".to_string()))?
            .insert(name.to_string(), result.clone());
        result
    }

    fn cached(&self, name: &str) -> EvalResult<Option<EvalResult<Value>>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| EvalError::Prepare("variable cache poisoned".to_string()))?;
        Ok(cache.get(name).cloned())
    }

    /// The first cached failure among `names`.
    fn failure(&self, names: &[String]) -> EvalResult<Option<EvalError>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| EvalError::Prepare("variable cache poisoned".to_string()))?;
        Ok(names.iter().find_map(|name| match cache.get(name) {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }))
    }
}

fn root_of<'c>(mut ctx: &'c Context<'c>) -> &'c Context<'c> {
    while let Context::Child { parent, .. } = ctx {
        ctx = *parent;
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references() {
        let compiled =
            CelExpression::compile("variables.a + variables['b'] > size(variables.a)").unwrap();
        assert_eq!(compiled.variable_refs(), ["a", "b"]);
        assert!(compiled.identifiers().is_empty());
        assert_eq!(compiled.functions(), ["size"]);

        let compiled = CelExpression::compile("object.variables_x == 1").unwrap();
        assert!(compiled.variable_refs().is_empty());
        assert_eq!(compiled.identifiers(), ["object"]);
    }

    #[test]
    fn test_references_skip_string_literals() {
        let compiled =
            CelExpression::compile("object.metadata.name != 'variables.x' && \"request\" != ''")
                .unwrap();
        assert!(compiled.variable_refs().is_empty());
        assert_eq!(compiled.identifiers(), ["object"]);
    }

    #[test]
    fn test_comprehension_locals_are_not_identifiers() {
        let compiled =
            CelExpression::compile("object.spec.containers.all(c, c.image != '' && has(c.name))")
                .unwrap();
        assert_eq!(compiled.identifiers(), ["object"]);
        assert_eq!(compiled.functions(), ["all", "has"]);
    }

    #[test]
    fn test_cancellation() {
        let c = Cancellation::new();
        assert!(c.check().is_ok());
        let shared = c.clone();
        shared.cancel();
        assert_eq!(c.check(), Err(EvalError::Cancelled));
    }

    #[test]
    fn test_expired_deadline() {
        let c = Cancellation::with_timeout(Duration::ZERO);
        assert_eq!(c.check(), Err(EvalError::DeadlineExceeded));
    }

    #[test]
    fn test_or_timeout_keeps_caller_deadline() {
        let c = Cancellation::new().or_timeout(Some(Duration::from_secs(60)));
        assert!(c.check().is_ok());
        let expired = Cancellation::with_timeout(Duration::ZERO).or_timeout(Some(Duration::from_secs(60)));
        assert_eq!(expired.check(), Err(EvalError::DeadlineExceeded));
    }
}
