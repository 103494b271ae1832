//! Beans: named objects whose methods can be invoked from a route.
//!
//! A bean is a set of named [`BeanMethod`]s. Each method declares how its
//! arguments are bound from the exchange ([`ParamBinding`]) and the type each
//! argument is converted to. A method returning `Some(value)` replaces the
//! message body; `None` leaves it untouched.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use switchyard_core::{BodyType, Exchange, Expression, TypeKey, Value};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Parameter binding
// ---------------------------------------------------------------------------

/// Where a method argument comes from.
#[derive(Debug, Clone)]
pub enum ParamSource {
    Body,
    Header(String),
    Property(String),
    Constant(Value),
    Expression(Expression),
    ExchangeId,
}

/// Binds one method argument.
#[derive(Debug, Clone)]
pub struct ParamBinding {
    source: ParamSource,
    kind: TypeKey,
}

impl ParamBinding {
    #[must_use]
    pub fn body(kind: TypeKey) -> Self {
        Self {
            source: ParamSource::Body,
            kind,
        }
    }

    pub fn header(name: impl Into<String>, kind: TypeKey) -> Self {
        Self {
            source: ParamSource::Header(name.into()),
            kind,
        }
    }

    pub fn property(name: impl Into<String>, kind: TypeKey) -> Self {
        Self {
            source: ParamSource::Property(name.into()),
            kind,
        }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self {
            source: ParamSource::Constant(value.into()),
            kind: TypeKey::Any,
        }
    }

    #[must_use]
    pub fn expression(expression: Expression, kind: TypeKey) -> Self {
        Self {
            source: ParamSource::Expression(expression),
            kind,
        }
    }

    #[must_use]
    pub fn exchange_id() -> Self {
        Self {
            source: ParamSource::ExchangeId,
            kind: TypeKey::Text,
        }
    }

    fn bind(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        let raw = match &self.source {
            ParamSource::Body => exchange.body().clone(),
            ParamSource::Header(name) => exchange.header(name).cloned().unwrap_or_default(),
            ParamSource::Property(name) => exchange.property(name).cloned().unwrap_or_default(),
            ParamSource::Constant(value) => value.clone(),
            ParamSource::Expression(expression) => expression.evaluate(exchange)?,
            ParamSource::ExchangeId => Value::from(exchange.id()),
        };
        Ok(exchange.converters().convert(&raw, self.kind)?)
    }
}

/// Arguments bound for one invocation.
#[derive(Debug, Clone, Default)]
pub struct BeanArgs(Vec<Value>);

impl BeanArgs {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn value(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&Value::Null)
    }

    /// Argument `index` as `T`; `None` for a null or missing argument.
    #[must_use]
    pub fn get<T: BodyType>(&self, index: usize) -> Option<T> {
        T::from_value(self.value(index).clone())
    }

    /// Argument `index` as `T`, failing for null or missing arguments.
    ///
    /// # Errors
    ///
    /// Returns an error naming the argument position.
    pub fn require<T: BodyType>(&self, index: usize) -> anyhow::Result<T> {
        self.get(index)
            .with_context(|| format!("bean argument {index} is missing or not a {}", T::KEY))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Bean / BeanMethod
// ---------------------------------------------------------------------------

type MethodFn = Arc<dyn Fn(BeanArgs) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// One invocable method.
#[derive(Clone)]
pub struct BeanMethod {
    params: Vec<ParamBinding>,
    handler: MethodFn,
}

impl BeanMethod {
    /// An asynchronous method.
    pub fn new<F, Fut>(params: Vec<ParamBinding>, handler: F) -> Self
    where
        F: Fn(BeanArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        Self {
            params,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// A synchronous method.
    pub fn sync<F>(params: Vec<ParamBinding>, handler: F) -> Self
    where
        F: Fn(BeanArgs) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(params, move |args| {
            let handler = Arc::clone(&handler);
            async move { handler(args) }
        })
    }

    /// Binds arguments from `exchange` and runs the method.
    ///
    /// # Errors
    ///
    /// Returns binding/conversion errors and whatever the method returns.
    pub async fn invoke(&self, exchange: &Exchange) -> anyhow::Result<Option<Value>> {
        let args = self
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| p.bind(exchange).with_context(|| format!("binding argument {i}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        (self.handler)(BeanArgs(args)).await
    }
}

impl std::fmt::Debug for BeanMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanMethod")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A named set of methods.
#[derive(Debug, Clone, Default)]
pub struct Bean {
    methods: BTreeMap<String, BeanMethod>,
    default_method: Option<String>,
}

impl Bean {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, name: impl Into<String>, method: BeanMethod) -> Self {
        self.methods.insert(name.into(), method);
        self
    }

    /// Method used when a route names none and the bean has several.
    #[must_use]
    pub fn default_method(mut self, name: impl Into<String>) -> Self {
        self.default_method = Some(name.into());
        self
    }

    fn select(&self, bean: &str, method: Option<&str>) -> Result<&BeanMethod, EngineError> {
        let name = match method {
            Some(name) => name,
            None => match (&self.default_method, self.methods.len()) {
                (Some(name), _) => name.as_str(),
                (None, 1) => self.methods.keys().next().map_or("", String::as_str),
                (None, _) => {
                    return Err(EngineError::NoSuchBeanMethod {
                        bean: bean.to_string(),
                        method: "<unspecified>".to_string(),
                    })
                }
            },
        };
        self.methods
            .get(name)
            .ok_or_else(|| EngineError::NoSuchBeanMethod {
                bean: bean.to_string(),
                method: name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// BeanRegistry
// ---------------------------------------------------------------------------

/// Beans by name.
#[derive(Debug, Default)]
pub struct BeanRegistry {
    beans: DashMap<String, Arc<Bean>>,
}

impl BeanRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, bean: Bean) {
        self.beans.insert(name.into(), Arc::new(bean));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.beans.contains_key(name)
    }

    /// Resolves the method a route step will call.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoSuchBean`] or [`EngineError::NoSuchBeanMethod`].
    pub fn method(&self, bean: &str, method: Option<&str>) -> Result<BeanMethod, EngineError> {
        let entry = self
            .beans
            .get(bean)
            .ok_or_else(|| EngineError::NoSuchBean(bean.to_string()))?;
        entry.select(bean, method).cloned()
    }
}

/// Invokes `method` and applies its result to the exchange body.
///
/// # Errors
///
/// Propagates the method's error.
pub async fn invoke_on(method: &BeanMethod, exchange: &mut Exchange) -> anyhow::Result<()> {
    if let Some(result) = method.invoke(exchange).await? {
        exchange.set_body(result);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use switchyard_core::TypeConverterRegistry;

    use super::*;

    fn exchange(body: impl Into<Value>) -> Exchange {
        let mut ex = Exchange::new(Arc::new(TypeConverterRegistry::with_defaults()));
        ex.set_body(body);
        ex
    }

    fn greeter(calls: Arc<AtomicU32>) -> Bean {
        Bean::new()
            .method(
                "hello",
                BeanMethod::sync(vec![ParamBinding::body(TypeKey::Text)], move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let name: String = args.require(0)?;
                    Ok(Some(Value::from(format!("{name} World"))))
                }),
            )
            .method(
                "count",
                BeanMethod::sync(vec![ParamBinding::header("qty", TypeKey::Int)], |args| {
                    Ok(Some(Value::Int(args.get::<i64>(0).unwrap_or(0) * 2)))
                }),
            )
    }

    #[tokio::test]
    async fn invokes_named_method_with_converted_arguments() {
        let calls = Arc::new(AtomicU32::new(0));
        let beans = BeanRegistry::new();
        beans.register("greeter", greeter(calls.clone()));

        let mut ex = exchange("Hello");
        let method = beans.method("greeter", Some("hello")).unwrap();
        invoke_on(&method, &mut ex).await.unwrap();
        assert_eq!(ex.body(), &Value::from("Hello World"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut ex = exchange(Value::Null);
        ex.set_header("qty", "21");
        let method = beans.method("greeter", Some("count")).unwrap();
        invoke_on(&method, &mut ex).await.unwrap();
        assert_eq!(ex.body(), &Value::Int(42));
    }

    #[test]
    fn method_selection_rules() {
        let beans = BeanRegistry::new();
        beans.register("greeter", greeter(Arc::new(AtomicU32::new(0))));
        beans.register(
            "single",
            Bean::new().method("only", BeanMethod::sync(vec![], |_| Ok(None))),
        );

        assert!(beans.method("single", None).is_ok());
        assert!(matches!(
            beans.method("greeter", None),
            Err(EngineError::NoSuchBeanMethod { .. })
        ));
        assert!(matches!(
            beans.method("greeter", Some("nope")),
            Err(EngineError::NoSuchBeanMethod { method, .. }) if method == "nope"
        ));
        assert!(matches!(beans.method("ghost", None), Err(EngineError::NoSuchBean(_))));
    }

    #[tokio::test]
    async fn unconvertible_argument_fails_the_invocation() {
        let method = BeanMethod::sync(vec![ParamBinding::body(TypeKey::Int)], |_| Ok(None));
        let err = method.invoke(&exchange("not a number")).await.unwrap_err();
        assert!(format!("{err:#}").contains("binding argument 0"));
    }

    #[tokio::test]
    async fn none_result_keeps_body() {
        let method = BeanMethod::new(vec![], |_| async { Ok(None) });
        let mut ex = exchange("keep");
        invoke_on(&method, &mut ex).await.unwrap();
        assert_eq!(ex.body(), &Value::from("keep"));
    }
}
