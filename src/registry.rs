//! Workflow and activity registration.
//!
//! Registries are per test suite / per worker; values are `Arc`ed
//! handler trait objects so a registry clone is cheap and shareable
//! with child workflow environments. Typed registration wraps the
//! handler with codec encode/decode so user functions take and return
//! ordinary serializable types.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::EncodedValue;

/// A registered workflow implementation.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: WorkflowContext,
        input: EncodedValue,
    ) -> Result<EncodedValue, WorkflowError>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, EncodedValue) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<EncodedValue, WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, EncodedValue) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<EncodedValue, WorkflowError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: WorkflowContext,
        input: EncodedValue,
    ) -> Result<EncodedValue, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// A registered activity implementation.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn execute(&self, input: EncodedValue) -> Result<EncodedValue, WorkflowError>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(EncodedValue) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<EncodedValue, WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(EncodedValue) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<EncodedValue, WorkflowError>> + Send + 'static,
{
    async fn execute(&self, input: EncodedValue) -> Result<EncodedValue, WorkflowError> {
        (self.0)(input).await
    }
}

/// Wrap a typed workflow function with codec decode/encode.
pub(crate) fn typed_workflow_handler<In, Out, F, Fut>(f: F) -> Arc<dyn WorkflowHandler>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
{
    let wrapper = move |ctx: WorkflowContext, input: EncodedValue| {
        let f = f.clone();
        async move {
            let input: In = input.get()?;
            let out: Out = f(ctx, input).await?;
            EncodedValue::encode(&out)
        }
    };
    Arc::new(FnWorkflow(wrapper))
}

/// Wrap a typed activity function with codec decode/encode.
pub(crate) fn typed_activity_handler<In, Out, F, Fut>(f: F) -> Arc<dyn ActivityHandler>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
{
    let wrapper = move |input: EncodedValue| {
        let f = f.clone();
        async move {
            let input: In = input.get()?;
            let out: Out = f(input).await?;
            EncodedValue::encode(&out)
        }
    };
    Arc::new(FnActivity(wrapper))
}

/// Registry mapping workflow names to handlers. Registering the same
/// name twice is a programming error and panics.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<dyn WorkflowHandler>>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow on raw encoded payloads.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowContext, EncodedValue) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<EncodedValue, WorkflowError>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnWorkflow(f)));
    }

    /// Register a workflow whose input and output move through the
    /// codec. Arguments must be codec-serializable.
    pub fn register_typed<In, Out, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.insert(name.into(), typed_workflow_handler(f));
    }

    fn insert(&self, name: String, handler: Arc<dyn WorkflowHandler>) {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&name) {
            panic!("duplicate workflow registration: {name}");
        }
        map.insert(name, handler);
    }

    pub(crate) fn register_if_absent(&self, name: &str, handler: Arc<dyn WorkflowHandler>) {
        self.inner
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(handler);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registry mapping activity names to handlers.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<dyn ActivityHandler>>>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity on raw encoded payloads.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(EncodedValue) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<EncodedValue, WorkflowError>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)));
    }

    /// Register an activity whose input and output move through the
    /// codec.
    pub fn register_typed<In, Out, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.insert(name.into(), typed_activity_handler(f));
    }

    fn insert(&self, name: String, handler: Arc<dyn ActivityHandler>) {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&name) {
            panic!("duplicate activity registration: {name}");
        }
        map.insert(name, handler);
    }

    pub(crate) fn register_if_absent(&self, name: &str, handler: Arc<dyn ActivityHandler>) {
        self.inner
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(handler);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_activity_round_trips_through_codec() {
        let registry = ActivityRegistry::new();
        registry.register_typed("add", |(a, b): (i32, i32)| async move { Ok(a + b) });
        let handler = registry.get("add").unwrap();
        let out = handler
            .execute(EncodedValue::encode(&(2, 3)).unwrap())
            .await
            .unwrap();
        assert_eq!(out.get::<i32>().unwrap(), 5);
    }

    #[test]
    #[should_panic(expected = "duplicate activity registration")]
    fn duplicate_activity_registration_panics() {
        let registry = ActivityRegistry::new();
        registry.register_typed("dup", |(): ()| async move { Ok(0) });
        registry.register_typed("dup", |(): ()| async move { Ok(1) });
    }

    #[test]
    fn register_if_absent_keeps_first_registration() {
        let registry = ActivityRegistry::new();
        registry.register_typed("probe", |(): ()| async move { Ok("first") });
        registry.register_if_absent(
            "probe",
            typed_activity_handler(|(): ()| async move { Ok("second") }),
        );
        assert_eq!(registry.registered_names(), vec!["probe".to_string()]);
    }
}
